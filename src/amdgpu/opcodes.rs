//! Opcode tables for the GFX9 encoding family.
//!
//! One enum per encoding format, each carrying the opcode field value used
//! by the hardware. The flat [`Opcode`] wrapper is what instruction records
//! and machine IR carry; pseudo opcodes used only by the code generator
//! live in [`PseudoOp`].

use std::fmt;

macro_rules! opcode_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn from_field(value: u32) -> Option<Self> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn field(self) -> u32 {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $($name::$variant => {
                        const NAME: &str = stringify!($variant);
                        NAME
                    },)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.mnemonic().to_ascii_lowercase())
            }
        }
    };
}

opcode_enum!(Sop2Op {
    S_ADD_U32 = 0,
    S_SUB_U32 = 1,
    S_ADD_I32 = 2,
    S_SUB_I32 = 3,
    S_ADDC_U32 = 4,
    S_SUBB_U32 = 5,
    S_MIN_I32 = 6,
    S_MIN_U32 = 7,
    S_MAX_I32 = 8,
    S_MAX_U32 = 9,
    S_CSELECT_B32 = 10,
    S_CSELECT_B64 = 11,
    S_AND_B32 = 12,
    S_AND_B64 = 13,
    S_OR_B32 = 14,
    S_OR_B64 = 15,
    S_XOR_B32 = 16,
    S_XOR_B64 = 17,
    S_ANDN2_B32 = 18,
    S_ANDN2_B64 = 19,
    S_LSHL_B32 = 28,
    S_LSHL_B64 = 29,
    S_LSHR_B32 = 30,
    S_LSHR_B64 = 31,
    S_ASHR_I32 = 32,
    S_ASHR_I64 = 33,
    S_MUL_I32 = 36,
});

opcode_enum!(SopkOp {
    S_MOVK_I32 = 0,
    S_CMOVK_I32 = 1,
    S_CMPK_EQ_I32 = 2,
    S_CMPK_LG_I32 = 3,
    S_CMPK_GT_I32 = 4,
    S_CMPK_GE_I32 = 5,
    S_CMPK_LT_I32 = 6,
    S_CMPK_LE_I32 = 7,
    S_CMPK_EQ_U32 = 8,
    S_CMPK_LG_U32 = 9,
    S_ADDK_I32 = 14,
    S_MULK_I32 = 15,
    S_GETREG_B32 = 17,
    S_SETREG_B32 = 18,
    S_CALL_B64 = 21,
});

opcode_enum!(Sop1Op {
    S_MOV_B32 = 0,
    S_MOV_B64 = 1,
    S_CMOV_B32 = 2,
    S_CMOV_B64 = 3,
    S_NOT_B32 = 4,
    S_NOT_B64 = 5,
    S_BREV_B32 = 8,
    S_BCNT1_I32_B32 = 12,
    S_FF1_I32_B32 = 16,
    S_SEXT_I32_I8 = 22,
    S_SEXT_I32_I16 = 23,
    S_GETPC_B64 = 28,
    S_SETPC_B64 = 29,
    S_SWAPPC_B64 = 30,
    S_AND_SAVEEXEC_B64 = 32,
    S_OR_SAVEEXEC_B64 = 33,
    S_XOR_SAVEEXEC_B64 = 34,
});

opcode_enum!(SopcOp {
    S_CMP_EQ_I32 = 0,
    S_CMP_LG_I32 = 1,
    S_CMP_GT_I32 = 2,
    S_CMP_GE_I32 = 3,
    S_CMP_LT_I32 = 4,
    S_CMP_LE_I32 = 5,
    S_CMP_EQ_U32 = 6,
    S_CMP_LG_U32 = 7,
    S_CMP_GT_U32 = 8,
    S_CMP_GE_U32 = 9,
    S_CMP_LT_U32 = 10,
    S_CMP_LE_U32 = 11,
    S_CMP_EQ_U64 = 18,
    S_CMP_LG_U64 = 19,
});

opcode_enum!(SoppOp {
    S_NOP = 0,
    S_ENDPGM = 1,
    S_BRANCH = 2,
    S_CBRANCH_SCC0 = 4,
    S_CBRANCH_SCC1 = 5,
    S_CBRANCH_VCCZ = 6,
    S_CBRANCH_VCCNZ = 7,
    S_CBRANCH_EXECZ = 8,
    S_CBRANCH_EXECNZ = 9,
    S_BARRIER = 10,
    S_WAITCNT = 12,
    S_SLEEP = 14,
    S_SETPRIO = 15,
    S_TRAP = 18,
    S_ICACHE_INV = 19,
});

opcode_enum!(SmemOp {
    S_LOAD_DWORD = 0,
    S_LOAD_DWORDX2 = 1,
    S_LOAD_DWORDX4 = 2,
    S_LOAD_DWORDX8 = 3,
    S_LOAD_DWORDX16 = 4,
    S_STORE_DWORD = 16,
    S_STORE_DWORDX2 = 17,
    S_STORE_DWORDX4 = 18,
    S_DCACHE_INV = 32,
    S_MEMTIME = 36,
    S_MEMREALTIME = 37,
    S_ATOMIC_ADD = 66,
});

opcode_enum!(Vop1Op {
    V_NOP = 0,
    V_MOV_B32 = 1,
    V_READFIRSTLANE_B32 = 2,
    V_CVT_F32_I32 = 5,
    V_CVT_F32_U32 = 6,
    V_CVT_U32_F32 = 7,
    V_CVT_I32_F32 = 8,
    V_NOT_B32 = 43,
    V_BFREV_B32 = 44,
    V_FFBH_U32 = 45,
});

opcode_enum!(Vop2Op {
    V_CNDMASK_B32 = 0,
    V_ADD_F32 = 1,
    V_SUB_F32 = 2,
    V_MUL_F32 = 5,
    V_LSHRREV_B32 = 16,
    V_ASHRREV_I32 = 17,
    V_LSHLREV_B32 = 18,
    V_AND_B32 = 19,
    V_OR_B32 = 20,
    V_XOR_B32 = 21,
    V_ADD_CO_U32 = 25,
    V_SUB_CO_U32 = 26,
    V_ADDC_CO_U32 = 28,
    V_ADD_U32 = 34,
    V_SUB_U32 = 35,
});

opcode_enum!(Vop3Op {
    V_MAD_U32_U24 = 451,
    V_BFE_U32 = 456,
    V_BFE_I32 = 457,
    V_FMA_F32 = 459,
    V_ADD3_U32 = 461,
    V_LSHL_ADD_U32 = 462,
    V_READLANE_B32 = 649,
    V_WRITELANE_B32 = 650,
    V_BCNT_U32_B32 = 651,
    V_MBCNT_LO_U32_B32 = 652,
    V_MBCNT_HI_U32_B32 = 653,
    V_LSHLREV_B64 = 655,
    V_LSHRREV_B64 = 656,
    V_ASHRREV_I64 = 657,
});

opcode_enum!(FlatOp {
    FLAT_LOAD_UBYTE = 16,
    FLAT_LOAD_USHORT = 18,
    FLAT_LOAD_DWORD = 20,
    FLAT_LOAD_DWORDX2 = 21,
    FLAT_LOAD_DWORDX4 = 23,
    FLAT_STORE_BYTE = 24,
    FLAT_STORE_SHORT = 26,
    FLAT_STORE_DWORD = 28,
    FLAT_STORE_DWORDX2 = 29,
    FLAT_STORE_DWORDX4 = 31,
    FLAT_ATOMIC_SWAP = 64,
    FLAT_ATOMIC_CMPSWAP = 65,
    FLAT_ATOMIC_ADD = 66,
});

/// Flat-family memory segment, bits [15:14] of the first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlatSeg {
    Flat = 0,
    Scratch = 1,
    Global = 2,
}

impl FlatSeg {
    pub fn from_field(value: u32) -> Option<Self> {
        match value {
            0 => Some(FlatSeg::Flat),
            1 => Some(FlatSeg::Scratch),
            2 => Some(FlatSeg::Global),
            _ => None,
        }
    }
}

/// Opcodes that exist only in machine IR, never in machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoOp {
    /// Register-to-register copy; resolved by register allocation into
    /// `s_mov_b32`/`v_mov_b32` family moves.
    Copy,
    /// Inline-asm placeholder carrying an intrinsic lowering index.
    InlineAsm,
    /// Call site for an injected instrumentation payload function,
    /// expanded by the prologue/epilogue pass.
    HookCall,
}

/// The flat opcode carried by instruction records and machine IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Sop2(Sop2Op),
    Sopk(SopkOp),
    Sop1(Sop1Op),
    Sopc(SopcOp),
    Sopp(SoppOp),
    Smem(SmemOp),
    Vop1(Vop1Op),
    Vop2(Vop2Op),
    Vop3(Vop3Op),
    Flat(FlatOp, FlatSeg),
    Pseudo(PseudoOp),
}

impl Opcode {
    /// Any branch, direct or indirect.
    pub fn is_branch(self) -> bool {
        self.is_direct_branch() || matches!(self, Opcode::Sop1(Sop1Op::S_SETPC_B64))
    }

    /// A branch whose target is a PC-relative immediate.
    pub fn is_direct_branch(self) -> bool {
        matches!(
            self,
            Opcode::Sopp(
                SoppOp::S_BRANCH
                    | SoppOp::S_CBRANCH_SCC0
                    | SoppOp::S_CBRANCH_SCC1
                    | SoppOp::S_CBRANCH_VCCZ
                    | SoppOp::S_CBRANCH_VCCNZ
                    | SoppOp::S_CBRANCH_EXECZ
                    | SoppOp::S_CBRANCH_EXECNZ
            )
        )
    }

    /// Conditional direct branches fall through when the condition fails.
    pub fn is_conditional_branch(self) -> bool {
        self.is_direct_branch() && !matches!(self, Opcode::Sopp(SoppOp::S_BRANCH))
    }

    /// Ends a basic block.
    pub fn is_terminator(self) -> bool {
        self.is_branch() || matches!(self, Opcode::Sopp(SoppOp::S_ENDPGM))
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            Opcode::Sopk(SopkOp::S_CALL_B64) | Opcode::Sop1(Sop1Op::S_SWAPPC_B64)
        )
    }

    /// Whether the instruction writes the scalar condition code.
    pub fn defs_scc(self) -> bool {
        match self {
            Opcode::Sop2(op) => !matches!(op, Sop2Op::S_CSELECT_B32 | Sop2Op::S_CSELECT_B64),
            Opcode::Sopc(_) => true,
            Opcode::Sopk(op) => matches!(
                op,
                SopkOp::S_CMPK_EQ_I32
                    | SopkOp::S_CMPK_LG_I32
                    | SopkOp::S_CMPK_GT_I32
                    | SopkOp::S_CMPK_GE_I32
                    | SopkOp::S_CMPK_LT_I32
                    | SopkOp::S_CMPK_LE_I32
                    | SopkOp::S_CMPK_EQ_U32
                    | SopkOp::S_CMPK_LG_U32
                    | SopkOp::S_ADDK_I32
            ),
            Opcode::Sop1(op) => matches!(
                op,
                Sop1Op::S_NOT_B32
                    | Sop1Op::S_NOT_B64
                    | Sop1Op::S_BCNT1_I32_B32
                    | Sop1Op::S_AND_SAVEEXEC_B64
                    | Sop1Op::S_OR_SAVEEXEC_B64
                    | Sop1Op::S_XOR_SAVEEXEC_B64
            ),
            _ => false,
        }
    }

    /// Number of leading def operands in the record's operand list.
    pub fn def_count(self) -> usize {
        match self {
            Opcode::Sopp(_) | Opcode::Sopc(_) => 0,
            Opcode::Smem(op) => {
                if matches!(
                    op,
                    SmemOp::S_STORE_DWORD
                        | SmemOp::S_STORE_DWORDX2
                        | SmemOp::S_STORE_DWORDX4
                        | SmemOp::S_DCACHE_INV
                ) {
                    0
                } else {
                    1
                }
            }
            Opcode::Flat(op, _) => {
                if matches!(
                    op,
                    FlatOp::FLAT_STORE_BYTE
                        | FlatOp::FLAT_STORE_SHORT
                        | FlatOp::FLAT_STORE_DWORD
                        | FlatOp::FLAT_STORE_DWORDX2
                        | FlatOp::FLAT_STORE_DWORDX4
                ) {
                    0
                } else {
                    1
                }
            }
            Opcode::Pseudo(PseudoOp::HookCall) => 0,
            _ => 1,
        }
    }

    /// Width, in dwords, of the destination operand.
    pub fn dst_dwords(self) -> u32 {
        match self {
            Opcode::Sop1(
                Sop1Op::S_MOV_B64
                | Sop1Op::S_CMOV_B64
                | Sop1Op::S_NOT_B64
                | Sop1Op::S_GETPC_B64
                | Sop1Op::S_SWAPPC_B64
                | Sop1Op::S_AND_SAVEEXEC_B64
                | Sop1Op::S_OR_SAVEEXEC_B64
                | Sop1Op::S_XOR_SAVEEXEC_B64,
            ) => 2,
            Opcode::Sop2(Sop2Op::S_CSELECT_B64 | Sop2Op::S_AND_B64 | Sop2Op::S_OR_B64
                | Sop2Op::S_XOR_B64 | Sop2Op::S_ANDN2_B64 | Sop2Op::S_LSHL_B64
                | Sop2Op::S_LSHR_B64 | Sop2Op::S_ASHR_I64) => 2,
            Opcode::Sopk(SopkOp::S_CALL_B64) => 2,
            Opcode::Smem(SmemOp::S_LOAD_DWORDX2) => 2,
            Opcode::Smem(SmemOp::S_LOAD_DWORDX4) => 4,
            Opcode::Smem(SmemOp::S_LOAD_DWORDX8) => 8,
            Opcode::Smem(SmemOp::S_LOAD_DWORDX16) => 16,
            Opcode::Smem(SmemOp::S_MEMTIME | SmemOp::S_MEMREALTIME) => 2,
            Opcode::Flat(FlatOp::FLAT_LOAD_DWORDX2, _) => 2,
            Opcode::Flat(FlatOp::FLAT_LOAD_DWORDX4, _) => 4,
            Opcode::Vop3(Vop3Op::V_LSHLREV_B64 | Vop3Op::V_LSHRREV_B64 | Vop3Op::V_ASHRREV_I64) => 2,
            _ => 1,
        }
    }

    pub fn mnemonic(self) -> String {
        match self {
            Opcode::Sop2(op) => op.to_string(),
            Opcode::Sopk(op) => op.to_string(),
            Opcode::Sop1(op) => op.to_string(),
            Opcode::Sopc(op) => op.to_string(),
            Opcode::Sopp(op) => op.to_string(),
            Opcode::Smem(op) => op.to_string(),
            Opcode::Vop1(op) => format!("{op}_e32"),
            Opcode::Vop2(op) => format!("{op}_e32"),
            Opcode::Vop3(op) => {
                if op.field() >= 448 {
                    op.to_string()
                } else {
                    format!("{op}_e64")
                }
            }
            Opcode::Flat(op, seg) => match seg {
                FlatSeg::Flat => op.to_string(),
                FlatSeg::Scratch => op.to_string().replacen("flat", "scratch", 1),
                FlatSeg::Global => op.to_string().replacen("flat", "global", 1),
            },
            Opcode::Pseudo(PseudoOp::Copy) => "COPY".to_string(),
            Opcode::Pseudo(PseudoOp::InlineAsm) => "INLINEASM".to_string(),
            Opcode::Pseudo(PseudoOp::HookCall) => "HOOK_CALL".to_string(),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_round_trip() {
        assert_eq!(Sop2Op::from_field(Sop2Op::S_ADD_U32.field()), Some(Sop2Op::S_ADD_U32));
        assert_eq!(SoppOp::from_field(2), Some(SoppOp::S_BRANCH));
        assert_eq!(Vop3Op::from_field(649), Some(Vop3Op::V_READLANE_B32));
        assert_eq!(Sop2Op::from_field(1000), None);
    }

    #[test]
    fn branch_classification() {
        assert!(Opcode::Sopp(SoppOp::S_BRANCH).is_direct_branch());
        assert!(Opcode::Sopp(SoppOp::S_CBRANCH_SCC1).is_conditional_branch());
        assert!(!Opcode::Sopp(SoppOp::S_BRANCH).is_conditional_branch());
        assert!(Opcode::Sop1(Sop1Op::S_SETPC_B64).is_branch());
        assert!(!Opcode::Sop1(Sop1Op::S_SETPC_B64).is_direct_branch());
        assert!(Opcode::Sopp(SoppOp::S_ENDPGM).is_terminator());
        assert!(!Opcode::Sopp(SoppOp::S_NOP).is_terminator());
    }

    #[test]
    fn scc_defs() {
        assert!(Opcode::Sop2(Sop2Op::S_ADD_U32).defs_scc());
        assert!(!Opcode::Sop2(Sop2Op::S_CSELECT_B32).defs_scc());
        assert!(Opcode::Sopc(SopcOp::S_CMP_EQ_U32).defs_scc());
        assert!(!Opcode::Vop2(Vop2Op::V_ADD_U32).defs_scc());
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::Sop2(Sop2Op::S_ADD_U32).mnemonic(), "s_add_u32");
        assert_eq!(Opcode::Vop2(Vop2Op::V_ADD_U32).mnemonic(), "v_add_u32_e32");
        assert_eq!(
            Opcode::Flat(FlatOp::FLAT_LOAD_DWORD, FlatSeg::Global).mnemonic(),
            "global_load_dword"
        );
    }
}
