// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Field extraction helpers for little-endian dword layouts.

fn mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

/// Extracts `width` bits of `value` starting at bit `shift`.
pub(crate) fn get(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & mask(width)
}

/// Returns `value` with `width` bits at `shift` replaced by the low bits of `field`.
pub(crate) fn set(value: u32, shift: u32, width: u32, field: u32) -> u32 {
    let mask = mask(width) << shift;
    (value & !mask) | ((field << shift) & mask)
}

pub(crate) fn get_bit(value: u32, bit: u32) -> bool {
    value & (1 << bit) != 0
}

pub(crate) fn set_bit(value: u32, bit: u32, on: bool) -> u32 {
    if on {
        value | (1 << bit)
    } else {
        value & !(1 << bit)
    }
}

pub(crate) fn lo32(value: u64) -> u32 {
    value as u32
}

pub(crate) fn hi32(value: u64) -> u32 {
    (value >> 32) as u32
}

pub(crate) fn join64(lo: u32, hi: u32) -> u64 {
    (hi as u64) << 32 | lo as u64
}
