// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

//! On-demand structural analysis of guest instructions.
//!
//! Analyses are built facet by facet: printable disassembly, opcode level
//! information, operand breakdown, and best-effort symbol resolution. The
//! manager caches them per region (or globally for instructions outside
//! any region) and rebuilds a cached analysis only when a caller requests
//! facets it does not cover.

use bad64::{Imm, Operand};

use crate::{
    aarch64::{self, GprPlacement},
    memory::Address,
    patch::InstMetadata,
};

bitflags::bitflags! {
    /// Analysis facets. Each facet fills a distinct group of
    /// [`InstAnalysis`] fields.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AnalysisType: u8 {
        /// Printable disassembly text.
        const DISASSEMBLY = 0b0001;
        /// Address, size, opcode predicates and mnemonic.
        const INSTRUCTION = 0b0010;
        /// Operand breakdown.
        const OPERANDS = 0b0100;
        /// Nearest exported symbol and module.
        const SYMBOL = 0b1000;
    }
}

/// Classification of an analysed operand.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandType {
    /// A register of the tracked GPR context.
    Gpr,
    /// An immediate value.
    Imm,
    /// A condition predicate.
    Pred,
}

bitflags::bitflags! {
    /// How an instruction accesses a register operand.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RegAccess: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// One analysed operand.
#[derive(Copy, Clone, Debug)]
pub struct OperandAnalysis {
    pub opd_type: OperandType,
    /// Immediate value, condition code, or register number.
    pub value: u64,
    /// Accessed bytes.
    pub size: u16,
    /// Byte offset of the access inside the containing context register.
    pub reg_off: u16,
    /// Index of the containing register in the GPR context.
    pub reg_ctx_idx: u16,
    /// The decoded register, for register operands.
    pub reg: Option<bad64::Reg>,
    /// Empty for non-register operands.
    pub reg_access: RegAccess,
}

/// Analysis of one guest instruction, filled facet by facet.
#[derive(Debug)]
pub struct InstAnalysis {
    /// Facets this analysis covers.
    pub analysis_type: AnalysisType,
    /// Printable disassembly ([`AnalysisType::DISASSEMBLY`]).
    pub disassembly: Option<String>,
    /// Guest address ([`AnalysisType::INSTRUCTION`]).
    pub address: Address,
    /// Guest bytes occupied ([`AnalysisType::INSTRUCTION`]).
    pub inst_size: u16,
    /// Whether the instruction can change the program counter.
    pub affect_control_flow: bool,
    pub is_branch: bool,
    pub is_call: bool,
    pub is_return: bool,
    pub is_compare: bool,
    pub is_predicable: bool,
    pub may_load: bool,
    pub may_store: bool,
    /// Opcode name ([`AnalysisType::INSTRUCTION`]).
    pub mnemonic: Option<String>,
    /// Analysed operands ([`AnalysisType::OPERANDS`]).
    pub operands: Vec<OperandAnalysis>,
    /// Nearest exported symbol at or below the address
    /// ([`AnalysisType::SYMBOL`]).
    pub symbol: Option<String>,
    /// Guest bytes between the symbol and the address.
    pub symbol_offset: u64,
    /// Basename of the module hosting the address.
    pub module: Option<String>,
}

impl InstAnalysis {
    /// Builds an analysis of `metadata` covering exactly the facets of
    /// `ty`. The manager caches built analyses; standalone callers may
    /// build throwaway ones directly.
    pub fn build(metadata: &InstMetadata, ty: AnalysisType) -> Self {
        let mut analysis = Self {
            analysis_type: ty,
            disassembly: None,
            address: Address(0),
            inst_size: 0,
            affect_control_flow: false,
            is_branch: false,
            is_call: false,
            is_return: false,
            is_compare: false,
            is_predicable: false,
            may_load: false,
            may_store: false,
            mnemonic: None,
            operands: Vec::new(),
            symbol: None,
            symbol_offset: 0,
            module: None,
        };

        if ty.contains(AnalysisType::DISASSEMBLY) {
            analysis.disassembly = disas(&metadata.encoding, metadata.address).ok();
        }

        if ty.contains(AnalysisType::INSTRUCTION) {
            let desc = aarch64::instr_desc(metadata.inst.op());
            analysis.address = metadata.address;
            analysis.inst_size = metadata.inst_size;
            analysis.affect_control_flow = metadata.modify_pc;
            analysis.is_branch = desc.is_branch;
            analysis.is_call = desc.is_call;
            analysis.is_return = desc.is_return;
            analysis.is_compare = desc.is_compare;
            analysis.is_predicable = desc.is_predicable;
            analysis.may_load = desc.may_load;
            analysis.may_store = desc.may_store;
            analysis.mnemonic = Some(format!("{:?}", metadata.inst.op()));
        }

        if ty.contains(AnalysisType::OPERANDS) {
            analyse_operands(&mut analysis, metadata);
        }

        if ty.contains(AnalysisType::SYMBOL) {
            if let Some(info) = symbolize(metadata.address) {
                if info.symbol.is_some() {
                    analysis.symbol = info.symbol;
                    analysis.symbol_offset = metadata.address.0 - info.symbol_address.0;
                }
                analysis.module = info.module;
            }
        }

        analysis
    }
}

/// Returns `encoding` at `starting_address` as a disassembled string.
pub fn disas(encoding: &[u8], starting_address: Address) -> Result<String, Box<dyn std::error::Error>> {
    use capstone::prelude::*;

    let cs = Capstone::new()
        .arm64()
        .mode(capstone::arch::arm64::ArchMode::Arm)
        .endian(capstone::Endian::Little)
        .detail(false)
        .build()?;
    let insns = cs.disasm_count(encoding, starting_address.0, 1)?;
    let insn = insns
        .iter()
        .next()
        .ok_or_else(|| format!("No instruction at {starting_address}"))?;
    let mnemonic = insn.mnemonic().unwrap_or_default();
    Ok(match insn.op_str() {
        Some(op_str) if !op_str.is_empty() => format!("{mnemonic} {op_str}"),
        _ => mnemonic.to_string(),
    })
}

fn analyse_register(reg: bad64::Reg, access: RegAccess) -> Option<OperandAnalysis> {
    let GprPlacement {
        ctx_idx,
        size,
        reg_off,
    } = aarch64::nearest_gpr(reg)?;
    Some(OperandAnalysis {
        opd_type: OperandType::Gpr,
        value: u64::from(reg as u32),
        size,
        reg_off,
        reg_ctx_idx: ctx_idx,
        reg: Some(reg),
        reg_access: access,
    })
}

/// Merges the last pushed operand into an earlier one accessing the same
/// register slice, OR-ing the access kinds.
fn try_merge_current_register(operands: &mut Vec<OperandAnalysis>) {
    let last = operands.len() - 1;
    let current = operands[last];
    if let Some(previous) = operands[..last].iter_mut().find(|previous| {
        previous.opd_type == current.opd_type
            && previous.reg == current.reg
            && previous.size == current.size
            && previous.reg_off == current.reg_off
    }) {
        previous.reg_access |= current.reg_access;
        operands.pop();
    }
}

const fn imm_value(imm: &Imm) -> u64 {
    match imm {
        Imm::Signed(value) => *value as u64,
        Imm::Unsigned(value) => *value,
    }
}

fn analyse_operands(analysis: &mut InstAnalysis, metadata: &InstMetadata) {
    let desc = aarch64::instr_desc(metadata.inst.op());
    let operands = metadata.inst.operands();
    let write_count = if desc.is_variadic {
        operands.len()
    } else {
        usize::from(desc.num_defs)
    };
    for (i, operand) in operands.iter().enumerate() {
        match operand {
            Operand::Reg { reg, .. } => {
                let access = if i < write_count {
                    RegAccess::WRITE
                } else {
                    RegAccess::READ
                };
                // Size is only known for context registers; skip the rest.
                let Some(opa) = analyse_register(*reg, access) else {
                    continue;
                };
                analysis.operands.push(opa);
                try_merge_current_register(&mut analysis.operands);
            }
            Operand::Imm32 { imm, .. } | Operand::Imm64 { imm, .. } | Operand::Label(imm) => {
                analysis.operands.push(OperandAnalysis {
                    opd_type: OperandType::Imm,
                    value: imm_value(imm),
                    size: std::mem::size_of::<u64>() as u16,
                    reg_off: 0,
                    reg_ctx_idx: 0,
                    reg: None,
                    reg_access: RegAccess::empty(),
                });
            }
            Operand::Cond(cond) => {
                analysis.operands.push(OperandAnalysis {
                    opd_type: OperandType::Pred,
                    value: u64::from(*cond as u32),
                    size: std::mem::size_of::<u64>() as u16,
                    reg_off: 0,
                    reg_ctx_idx: 0,
                    reg: None,
                    reg_access: RegAccess::empty(),
                });
            }
            // Memory and system operands carry no analysable register
            // class.
            _ => {}
        }
    }
    for reg in desc.implicit_defs {
        if let Some(opa) = analyse_register(*reg, RegAccess::WRITE) {
            analysis.operands.push(opa);
            try_merge_current_register(&mut analysis.operands);
        }
    }
    for reg in desc.implicit_uses {
        if let Some(opa) = analyse_register(*reg, RegAccess::READ) {
            analysis.operands.push(opa);
            try_merge_current_register(&mut analysis.operands);
        }
    }
}

/// Best-effort resolution of an address against the host's loaded modules.
pub struct SymbolInfo {
    pub symbol: Option<String>,
    pub symbol_address: Address,
    pub module: Option<String>,
}

#[cfg(unix)]
fn symbolize(address: Address) -> Option<SymbolInfo> {
    use std::ffi::CStr;

    // SAFETY: `Dl_info` is plain data; all-zero is a valid initial state.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: `dladdr` inspects the pointer value without dereferencing it
    // and fills `info` on success.
    let ret = unsafe { libc::dladdr(address.0 as usize as *const libc::c_void, &mut info) };
    if ret == 0 {
        return None;
    }
    let symbol = if info.dli_sname.is_null() {
        None
    } else {
        // SAFETY: a non-null `dli_sname` points to a NUL-terminated name.
        Some(unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy().into_owned())
    };
    let module = if info.dli_fname.is_null() {
        None
    } else {
        // SAFETY: a non-null `dli_fname` points to a NUL-terminated path.
        let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned();
        path.rsplit('/').next().map(str::to_owned)
    };
    Some(SymbolInfo {
        symbol,
        symbol_address: Address(info.dli_saddr as usize as u64),
        module,
    })
}

#[cfg(not(unix))]
fn symbolize(_address: Address) -> Option<SymbolInfo> {
    None
}
