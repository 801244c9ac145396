// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

#![allow(dead_code)]

use inquiline::{
    memory::Address,
    patch::{InstMetadata, Patch},
};

pub const NOP: u32 = 0xd503_201f;

pub fn metadata(word: u32, address: u64) -> InstMetadata {
    InstMetadata::decode(word.to_le_bytes(), Address(address)).unwrap()
}

/// Builds a patch for `word` at `address`.
///
/// The translated host code is modelled as the guest encoding emitted
/// twice, a guest-to-host expansion of two.
pub fn patch(word: u32, address: u64) -> Patch {
    let encoding = word.to_le_bytes();
    let mut code = Vec::with_capacity(8);
    code.extend_from_slice(&encoding);
    code.extend_from_slice(&encoding);
    Patch::new(metadata(word, address), code)
}

/// A straight-line basic block of `len` nops starting at `start`.
pub fn nop_block(start: u64, len: usize) -> Vec<Patch> {
    (0..len)
        .map(|i| patch(NOP, start + 4 * i as u64))
        .collect()
}
