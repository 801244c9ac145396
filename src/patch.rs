// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

//! Translator output consumed by the basic block writer.
//!
//! A basic block reaches the manager as an ordered slice of [`Patch`]es,
//! one per guest instruction, each carrying the instruction's metadata and
//! the relocated host code the translator produced for it.

use crate::{aarch64, memory::Address};

/// Metadata of one decoded guest instruction.
pub struct InstMetadata {
    /// Guest address of the instruction.
    pub address: Address,
    /// Guest bytes occupied by the instruction.
    pub inst_size: u16,
    /// Whether the instruction can change the program counter.
    pub modify_pc: bool,
    /// Raw instruction bytes.
    pub encoding: [u8; 4],
    /// The decoded instruction.
    pub inst: bad64::Instruction,
}

impl InstMetadata {
    /// Decodes `encoding` at `address` into instruction metadata.
    pub fn decode(
        encoding: [u8; 4],
        address: Address,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inst = bad64::disasm(&encoding, address.0)
            .next()
            .ok_or_else(|| format!("No instruction decoded at {address}"))?
            .map_err(|err| format!("Error decoding instruction at {address}: {err}"))?;
        let desc = aarch64::instr_desc(inst.op());
        Ok(Self {
            address,
            inst_size: encoding.len() as u16,
            modify_pc: desc.is_branch || desc.is_call || desc.is_return,
            encoding,
            inst,
        })
    }
}

impl std::fmt::Debug for InstMetadata {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("InstMetadata")
            .field("address", &self.address)
            .field("inst_size", &self.inst_size)
            .field("modify_pc", &self.modify_pc)
            .finish_non_exhaustive()
    }
}

/// One guest instruction rewritten into relocated host code.
#[derive(Debug)]
pub struct Patch {
    pub metadata: InstMetadata,
    /// Host code emitted by the translator for this instruction.
    pub code: Vec<u8>,
}

impl Patch {
    pub fn new(metadata: InstMetadata, code: Vec<u8>) -> Self {
        Self { metadata, code }
    }

    /// Guest address range `[address, address + inst_size)` of the patch.
    #[inline]
    pub fn guest_end(&self) -> Address {
        Address(self.metadata.address.0 + u64::from(self.metadata.inst_size))
    }
}
