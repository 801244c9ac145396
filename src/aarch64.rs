// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

//! AArch64 guest register context and instruction descriptions.
//!
//! The instrumented context tracks the general purpose registers `x0..x30`
//! plus `sp`. Operand analysis resolves any decoded register to its
//! placement inside that context; registers outside it (vector, system,
//! zero registers) have no placement and are skipped by the analyzer.

use bad64::{Op, Reg};

/// Number of general purpose registers in the guest context.
pub const NUM_GPR: u16 = 32;

/// Context names, indexed by [`GprPlacement::ctx_idx`].
pub const GPR_NAMES: [&str; NUM_GPR as usize] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp",
];

/// Placement of a decoded register inside the GPR context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GprPlacement {
    /// Index of the containing full-width register in the context.
    pub ctx_idx: u16,
    /// Accessed bytes.
    pub size: u16,
    /// Byte offset of the access inside the full-width register.
    pub reg_off: u16,
}

/// Resolves `reg` to the nearest register of the GPR context.
///
/// `w`-forms resolve to the low half of their `x` parent. Returns `None`
/// for registers the context does not track.
pub fn nearest_gpr(reg: Reg) -> Option<GprPlacement> {
    let reg_no = reg as u32;
    if ((Reg::X0 as u32)..=(Reg::X30 as u32)).contains(&reg_no) {
        return Some(GprPlacement {
            ctx_idx: (reg_no - Reg::X0 as u32) as u16,
            size: 8,
            reg_off: 0,
        });
    }
    if ((Reg::W0 as u32)..=(Reg::W30 as u32)).contains(&reg_no) {
        return Some(GprPlacement {
            ctx_idx: (reg_no - Reg::W0 as u32) as u16,
            size: 4,
            reg_off: 0,
        });
    }
    match reg {
        Reg::SP => Some(GprPlacement {
            ctx_idx: NUM_GPR - 1,
            size: 8,
            reg_off: 0,
        }),
        Reg::WSP => Some(GprPlacement {
            ctx_idx: NUM_GPR - 1,
            size: 4,
            reg_off: 0,
        }),
        _ => None,
    }
}

/// Static description of a decoded opcode, as consumed by the analyzer.
#[derive(Copy, Clone, Debug, Default)]
pub struct InstrDesc {
    /// Leading explicit operands that are definitions.
    pub num_defs: u8,
    /// All explicit register operands are definitions.
    pub is_variadic: bool,
    pub is_branch: bool,
    pub is_call: bool,
    pub is_return: bool,
    pub is_compare: bool,
    pub is_predicable: bool,
    pub may_load: bool,
    pub may_store: bool,
    /// Registers written without appearing as explicit operands.
    pub implicit_defs: &'static [Reg],
    /// Registers read without appearing as explicit operands.
    pub implicit_uses: &'static [Reg],
}

const LINK_REG: &[Reg] = &[Reg::X30];

/// Returns the description of `op`.
///
/// The default is a destination-first data processing instruction (one
/// explicit definition, no implicit registers).
pub fn instr_desc(op: Op) -> InstrDesc {
    let dp = InstrDesc {
        num_defs: 1,
        ..InstrDesc::default()
    };
    match op {
        Op::B | Op::BR | Op::CBZ | Op::CBNZ | Op::TBZ | Op::TBNZ => InstrDesc {
            num_defs: 0,
            is_branch: true,
            ..InstrDesc::default()
        },
        Op::B_AL | Op::B_CC | Op::B_CS | Op::B_EQ | Op::B_GE | Op::B_GT | Op::B_HI | Op::B_LE
        | Op::B_LS | Op::B_LT | Op::B_MI | Op::B_NE | Op::B_NV | Op::B_PL | Op::B_VC
        | Op::B_VS => InstrDesc {
            num_defs: 0,
            is_branch: true,
            is_predicable: true,
            ..InstrDesc::default()
        },
        Op::BL | Op::BLR => InstrDesc {
            num_defs: 0,
            is_call: true,
            implicit_defs: LINK_REG,
            ..InstrDesc::default()
        },
        Op::RET => InstrDesc {
            num_defs: 0,
            is_return: true,
            implicit_uses: LINK_REG,
            ..InstrDesc::default()
        },
        Op::ERET => InstrDesc {
            num_defs: 0,
            is_return: true,
            ..InstrDesc::default()
        },
        Op::CMP | Op::CMN | Op::TST => InstrDesc {
            num_defs: 0,
            is_compare: true,
            ..InstrDesc::default()
        },
        Op::CCMP | Op::CCMN => InstrDesc {
            num_defs: 0,
            is_compare: true,
            is_predicable: true,
            ..InstrDesc::default()
        },
        Op::CSEL | Op::CSINC | Op::CSINV | Op::CSNEG | Op::CSET | Op::CSETM | Op::CINC
        | Op::CINV | Op::CNEG => InstrDesc {
            is_predicable: true,
            ..dp
        },
        Op::LDR | Op::LDRB | Op::LDRH | Op::LDRSB | Op::LDRSH | Op::LDRSW | Op::LDUR
        | Op::LDURB | Op::LDURH | Op::LDURSB | Op::LDURSH | Op::LDURSW | Op::LDAR | Op::LDARB
        | Op::LDARH | Op::LDXR | Op::LDXRB | Op::LDXRH | Op::LDAXR | Op::LDAXRB | Op::LDAXRH => {
            InstrDesc { may_load: true, ..dp }
        }
        Op::LDP | Op::LDPSW | Op::LDXP | Op::LDAXP => InstrDesc {
            num_defs: 2,
            may_load: true,
            ..InstrDesc::default()
        },
        Op::STR | Op::STRB | Op::STRH | Op::STUR | Op::STURB | Op::STURH | Op::STLR
        | Op::STLRB | Op::STLRH | Op::STP => InstrDesc {
            num_defs: 0,
            may_store: true,
            ..InstrDesc::default()
        },
        Op::STXR | Op::STXRB | Op::STXRH | Op::STLXR | Op::STLXRB | Op::STLXRH => InstrDesc {
            // Status register destination, then the stored value.
            num_defs: 1,
            may_store: true,
            ..InstrDesc::default()
        },
        Op::NOP | Op::SVC | Op::HVC | Op::SMC | Op::BRK | Op::HLT | Op::UDF | Op::DMB
        | Op::DSB | Op::ISB | Op::WFE | Op::WFI | Op::SEV | Op::SEVL | Op::YIELD => InstrDesc {
            num_defs: 0,
            ..InstrDesc::default()
        },
        _ => dp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_placement() {
        assert_eq!(
            nearest_gpr(Reg::X7),
            Some(GprPlacement {
                ctx_idx: 7,
                size: 8,
                reg_off: 0
            })
        );
        assert_eq!(
            nearest_gpr(Reg::W19),
            Some(GprPlacement {
                ctx_idx: 19,
                size: 4,
                reg_off: 0
            })
        );
        assert_eq!(
            nearest_gpr(Reg::SP),
            Some(GprPlacement {
                ctx_idx: 31,
                size: 8,
                reg_off: 0
            })
        );
        assert_eq!(nearest_gpr(Reg::XZR), None);
        assert_eq!(nearest_gpr(Reg::WZR), None);
        assert_eq!(nearest_gpr(Reg::V0), None);
    }

    #[test]
    fn descriptions() {
        assert!(instr_desc(Op::BL).is_call);
        assert_eq!(instr_desc(Op::BL).implicit_defs, &[Reg::X30]);
        assert!(instr_desc(Op::RET).is_return);
        assert!(instr_desc(Op::B_EQ).is_branch);
        assert!(instr_desc(Op::B_EQ).is_predicable);
        assert!(instr_desc(Op::CMP).is_compare);
        assert!(instr_desc(Op::LDR).may_load);
        assert!(instr_desc(Op::STR).may_store);
        assert_eq!(instr_desc(Op::ADD).num_defs, 1);
        assert_eq!(instr_desc(Op::STR).num_defs, 0);
    }
}
