//! Physical registers and the scalar-source operand encoding space.
//!
//! Source operand fields are 9 bits wide: values 0..=255 name scalar
//! registers, special registers, inline constants or a trailing literal;
//! values 256..=511 name VGPRs. Destination fields are narrower but index
//! the same space.

use std::fmt;

/// Register banks used by the allocator and the virtualisation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegBank {
    Scalar,
    Vector,
    /// Non-allocatable machine state (EXEC, VCC, M0, SCC, ...).
    Special,
}

/// A physical register of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysReg {
    /// s0..s101
    Sgpr(u16),
    /// v0..v255
    Vgpr(u16),
    FlatScratchLo,
    FlatScratchHi,
    XnackMaskLo,
    XnackMaskHi,
    VccLo,
    VccHi,
    /// ttmp0..ttmp15
    Ttmp(u16),
    M0,
    ExecLo,
    ExecHi,
    /// Scalar condition code. Not operand-encodable; tracked for liveness.
    Scc,
    /// VCCZ/EXECZ status bits, readable as scalar sources.
    VccZ,
    ExecZ,
}

impl PhysReg {
    pub fn bank(self) -> RegBank {
        match self {
            PhysReg::Sgpr(_) => RegBank::Scalar,
            PhysReg::Vgpr(_) => RegBank::Vector,
            _ => RegBank::Special,
        }
    }

    /// True for registers the instrumentation allocator may assign.
    pub fn is_allocatable(self) -> bool {
        matches!(self, PhysReg::Sgpr(_) | PhysReg::Vgpr(_))
    }

    /// The 9-bit source-operand encoding index, if this register has one.
    pub fn encoding_index(self) -> Option<u16> {
        Some(match self {
            PhysReg::Sgpr(n) if n < 102 => n,
            PhysReg::Sgpr(_) => return None,
            PhysReg::FlatScratchLo => 102,
            PhysReg::FlatScratchHi => 103,
            PhysReg::XnackMaskLo => 104,
            PhysReg::XnackMaskHi => 105,
            PhysReg::VccLo => 106,
            PhysReg::VccHi => 107,
            PhysReg::Ttmp(n) if n < 16 => 108 + n,
            PhysReg::Ttmp(_) => return None,
            PhysReg::M0 => 124,
            PhysReg::ExecLo => 126,
            PhysReg::ExecHi => 127,
            PhysReg::VccZ => 251,
            PhysReg::ExecZ => 252,
            PhysReg::Scc => 253,
            PhysReg::Vgpr(n) if n < 256 => 256 + n,
            PhysReg::Vgpr(_) => return None,
        })
    }

    /// Decodes a 9-bit operand index that names a register.
    pub fn from_encoding_index(index: u16) -> Option<PhysReg> {
        Some(match index {
            0..=101 => PhysReg::Sgpr(index),
            102 => PhysReg::FlatScratchLo,
            103 => PhysReg::FlatScratchHi,
            104 => PhysReg::XnackMaskLo,
            105 => PhysReg::XnackMaskHi,
            106 => PhysReg::VccLo,
            107 => PhysReg::VccHi,
            108..=123 => PhysReg::Ttmp(index - 108),
            124 => PhysReg::M0,
            126 => PhysReg::ExecLo,
            127 => PhysReg::ExecHi,
            251 => PhysReg::VccZ,
            252 => PhysReg::ExecZ,
            253 => PhysReg::Scc,
            256..=511 => PhysReg::Vgpr(index - 256),
            _ => return None,
        })
    }

    /// The register holding the high half of a 64-bit pair based at `self`.
    pub fn pair_hi(self) -> Option<PhysReg> {
        match self {
            PhysReg::Sgpr(n) if n + 1 < 102 => Some(PhysReg::Sgpr(n + 1)),
            PhysReg::Vgpr(n) if n + 1 < 256 => Some(PhysReg::Vgpr(n + 1)),
            PhysReg::VccLo => Some(PhysReg::VccHi),
            PhysReg::ExecLo => Some(PhysReg::ExecHi),
            PhysReg::FlatScratchLo => Some(PhysReg::FlatScratchHi),
            PhysReg::Ttmp(n) if n + 1 < 16 => Some(PhysReg::Ttmp(n + 1)),
            _ => None,
        }
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysReg::Sgpr(n) => write!(f, "s{n}"),
            PhysReg::Vgpr(n) => write!(f, "v{n}"),
            PhysReg::FlatScratchLo => write!(f, "flat_scratch_lo"),
            PhysReg::FlatScratchHi => write!(f, "flat_scratch_hi"),
            PhysReg::XnackMaskLo => write!(f, "xnack_mask_lo"),
            PhysReg::XnackMaskHi => write!(f, "xnack_mask_hi"),
            PhysReg::VccLo => write!(f, "vcc_lo"),
            PhysReg::VccHi => write!(f, "vcc_hi"),
            PhysReg::Ttmp(n) => write!(f, "ttmp{n}"),
            PhysReg::M0 => write!(f, "m0"),
            PhysReg::ExecLo => write!(f, "exec_lo"),
            PhysReg::ExecHi => write!(f, "exec_hi"),
            PhysReg::Scc => write!(f, "scc"),
            PhysReg::VccZ => write!(f, "vccz"),
            PhysReg::ExecZ => write!(f, "execz"),
        }
    }
}

/// A decoded source-operand field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SrcOperand {
    Reg(PhysReg),
    /// Inline integer constant (0, 1..=64, -1..=-16).
    Const(i32),
    /// Inline float constant.
    FConst(f32),
    /// A 32-bit literal follows the instruction word(s).
    Literal,
}

impl SrcOperand {
    /// Decodes a 9-bit source field.
    pub fn decode(index: u16) -> Option<SrcOperand> {
        Some(match index {
            128 => SrcOperand::Const(0),
            129..=192 => SrcOperand::Const((index - 128) as i32),
            193..=208 => SrcOperand::Const(-((index - 192) as i32)),
            240 => SrcOperand::FConst(0.5),
            241 => SrcOperand::FConst(-0.5),
            242 => SrcOperand::FConst(1.0),
            243 => SrcOperand::FConst(-1.0),
            244 => SrcOperand::FConst(2.0),
            245 => SrcOperand::FConst(-2.0),
            246 => SrcOperand::FConst(4.0),
            247 => SrcOperand::FConst(-4.0),
            248 => SrcOperand::FConst(0.159_154_94), // 1/(2*pi)
            255 => SrcOperand::Literal,
            _ => SrcOperand::Reg(PhysReg::from_encoding_index(index)?),
        })
    }

    /// Encodes back into a 9-bit source field. Returns `None` when the
    /// value has no inline encoding (the caller must emit a literal).
    pub fn encode(self) -> Option<u16> {
        match self {
            SrcOperand::Reg(r) => r.encoding_index(),
            SrcOperand::Const(0) => Some(128),
            SrcOperand::Const(v @ 1..=64) => Some(128 + v as u16),
            SrcOperand::Const(v @ -16..=-1) => Some(192 + (-v) as u16),
            SrcOperand::Const(_) => None,
            SrcOperand::FConst(v) => {
                let idx = match v {
                    x if x == 0.5 => 240,
                    x if x == -0.5 => 241,
                    x if x == 1.0 => 242,
                    x if x == -1.0 => 243,
                    x if x == 2.0 => 244,
                    x if x == -2.0 => 245,
                    x if x == 4.0 => 246,
                    x if x == -4.0 => 247,
                    _ => return None,
                };
                Some(idx)
            }
            SrcOperand::Literal => Some(255),
        }
    }
}

/// Encodes an integer as an inline constant if it fits, `None` otherwise.
pub fn inline_const(value: i64) -> Option<u16> {
    match value {
        0 => Some(128),
        1..=64 => Some(128 + value as u16),
        -16..=-1 => Some(192 + (-value) as u16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgpr_round_trip() {
        for n in 0..102 {
            let reg = PhysReg::Sgpr(n);
            assert_eq!(PhysReg::from_encoding_index(reg.encoding_index().unwrap()), Some(reg));
        }
    }

    #[test]
    fn vgpr_round_trip() {
        let reg = PhysReg::Vgpr(17);
        assert_eq!(reg.encoding_index(), Some(273));
        assert_eq!(PhysReg::from_encoding_index(273), Some(reg));
    }

    #[test]
    fn specials() {
        assert_eq!(PhysReg::from_encoding_index(106), Some(PhysReg::VccLo));
        assert_eq!(PhysReg::from_encoding_index(124), Some(PhysReg::M0));
        assert_eq!(PhysReg::from_encoding_index(126), Some(PhysReg::ExecLo));
        assert_eq!(PhysReg::Scc.encoding_index(), Some(253));
        assert!(!PhysReg::Scc.is_allocatable());
    }

    #[test]
    fn inline_constants() {
        assert_eq!(SrcOperand::decode(128), Some(SrcOperand::Const(0)));
        assert_eq!(SrcOperand::decode(129), Some(SrcOperand::Const(1)));
        assert_eq!(SrcOperand::decode(192), Some(SrcOperand::Const(64)));
        assert_eq!(SrcOperand::decode(193), Some(SrcOperand::Const(-1)));
        assert_eq!(SrcOperand::decode(208), Some(SrcOperand::Const(-16)));
        assert_eq!(SrcOperand::decode(255), Some(SrcOperand::Literal));
        assert_eq!(SrcOperand::Const(42).encode(), Some(170));
        assert_eq!(SrcOperand::Const(100).encode(), None);
    }

    #[test]
    fn pair_registers() {
        assert_eq!(PhysReg::Sgpr(4).pair_hi(), Some(PhysReg::Sgpr(5)));
        assert_eq!(PhysReg::VccLo.pair_hi(), Some(PhysReg::VccHi));
        assert_eq!(PhysReg::Scc.pair_hi(), None);
    }
}
