//! Machine-code encoder, the inverse of the decoder.
//!
//! Used by the object printer to turn register-allocated machine IR back
//! into instruction words. Exactly one trailing literal is supported per
//! instruction; immediates that fit the inline-constant space are encoded
//! inline.

use super::inst::{Inst, InstOperand};
use super::opcodes::*;
use super::operand::{PhysReg, SrcOperand};
use crate::error::{Error, Result};

fn unencodable(inst: &Inst, why: &str) -> Error {
    Error::codegen(format!("cannot encode `{inst}`: {why}"))
}

/// A source field plus an optional literal that must trail the instruction.
struct EncodedSrc {
    field: u32,
    literal: Option<u32>,
}

fn encode_src(inst: &Inst, op: &InstOperand) -> Result<EncodedSrc> {
    match op {
        InstOperand::Reg(r) => {
            let field = r
                .encoding_index()
                .ok_or_else(|| unencodable(inst, "register has no encoding"))?;
            Ok(EncodedSrc {
                field: field as u32,
                literal: None,
            })
        }
        InstOperand::Imm(v) => {
            if (-16..=64).contains(v) {
                let field = SrcOperand::Const(*v as i32)
                    .encode()
                    .expect("inline range is encodable");
                Ok(EncodedSrc {
                    field: field as u32,
                    literal: None,
                })
            } else if let Ok(lit) = u32::try_from(*v) {
                // literals are 32-bit patterns; the decoder zero-extends
                Ok(EncodedSrc {
                    field: 255,
                    literal: Some(lit),
                })
            } else {
                Err(unencodable(inst, "immediate does not fit a 32-bit literal"))
            }
        }
        InstOperand::FImm(v) => {
            let field = SrcOperand::FConst(*v)
                .encode()
                .ok_or_else(|| unencodable(inst, "float constant has no inline encoding"))?;
            Ok(EncodedSrc {
                field: field as u32,
                literal: None,
            })
        }
    }
}

fn reg_of(inst: &Inst, idx: usize) -> Result<PhysReg> {
    match inst.operands.get(idx) {
        Some(InstOperand::Reg(r)) => Ok(*r),
        _ => Err(unencodable(inst, "expected register operand")),
    }
}

fn imm_of(inst: &Inst, idx: usize) -> Result<i64> {
    match inst.operands.get(idx) {
        Some(InstOperand::Imm(v)) => Ok(*v),
        _ => Err(unencodable(inst, "expected immediate operand")),
    }
}

fn sdst_field(inst: &Inst, reg: PhysReg) -> Result<u32> {
    match reg {
        PhysReg::Vgpr(_) | PhysReg::Scc | PhysReg::VccZ | PhysReg::ExecZ => {
            Err(unencodable(inst, "invalid scalar destination"))
        }
        r => Ok(r
            .encoding_index()
            .ok_or_else(|| unencodable(inst, "register has no encoding"))? as u32),
    }
}

fn vgpr_field(inst: &Inst, reg: PhysReg) -> Result<u32> {
    match reg {
        PhysReg::Vgpr(n) => Ok(n as u32),
        _ => Err(unencodable(inst, "expected a VGPR")),
    }
}

fn push_words(out: &mut Vec<u8>, words: &[u32], literal: Option<u32>) {
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    if let Some(lit) = literal {
        out.extend_from_slice(&lit.to_le_bytes());
    }
}

/// Encodes one instruction into little-endian bytes.
pub fn encode(inst: &Inst) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(8);
    match inst.opcode {
        Opcode::Sop2(op) => {
            let dst = sdst_field(inst, reg_of(inst, 0)?)?;
            let src0 = encode_src(inst, &inst.operands[1])?;
            let src1 = encode_src(inst, &inst.operands[2])?;
            if src0.literal.is_some() && src1.literal.is_some() {
                return Err(unencodable(inst, "two literal operands"));
            }
            let word = (0b10u32 << 30) | (op.field() << 23) | (dst << 16) | (src1.field << 8)
                | src0.field;
            push_words(&mut out, &[word], src0.literal.or(src1.literal));
        }
        Opcode::Sopk(op) => {
            let dst = sdst_field(inst, reg_of(inst, 0)?)?;
            let simm = imm_of(inst, 1)?;
            let word = (0b1011u32 << 28) | (op.field() << 23) | (dst << 16)
                | (simm as u16 as u32);
            push_words(&mut out, &[word], None);
        }
        Opcode::Sop1(op) => {
            let dst = sdst_field(inst, reg_of(inst, 0)?)?;
            let src0 = encode_src(inst, &inst.operands[1])?;
            let word = (0b1011_1110_1u32 << 23) | (dst << 16) | (op.field() << 8) | src0.field;
            push_words(&mut out, &[word], src0.literal);
        }
        Opcode::Sopc(op) => {
            let src0 = encode_src(inst, &inst.operands[0])?;
            let src1 = encode_src(inst, &inst.operands[1])?;
            if src0.literal.is_some() && src1.literal.is_some() {
                return Err(unencodable(inst, "two literal operands"));
            }
            let word =
                (0b1011_1111_0u32 << 23) | (op.field() << 16) | (src1.field << 8) | src0.field;
            push_words(&mut out, &[word], src0.literal.or(src1.literal));
        }
        Opcode::Sopp(op) => {
            let simm = inst.operands.first().map_or(Ok(0), |_| imm_of(inst, 0))?;
            let word = (0b1011_1111_1u32 << 23) | (op.field() << 16) | (simm as u16 as u32);
            push_words(&mut out, &[word], None);
        }
        Opcode::Smem(op) => {
            let sdata = sdst_field(inst, reg_of(inst, 0)?)?;
            let sbase = match reg_of(inst, 1)? {
                PhysReg::Sgpr(n) if n % 2 == 0 => (n / 2) as u32,
                _ => return Err(unencodable(inst, "SMEM base must be an even SGPR pair")),
            };
            let offset = imm_of(inst, 2)?;
            if !(0..1 << 21).contains(&offset) {
                return Err(unencodable(inst, "SMEM offset out of range"));
            }
            let word0 = (0b110000u32 << 26) | (op.field() << 18) | (1 << 17) | (sdata << 6) | sbase;
            let word1 = offset as u32;
            push_words(&mut out, &[word0, word1], None);
        }
        Opcode::Vop1(op) => {
            let dst = reg_of(inst, 0)?;
            let vdst = match (op, dst) {
                (Vop1Op::V_READFIRSTLANE_B32, PhysReg::Sgpr(n)) => n as u32,
                (_, PhysReg::Vgpr(n)) => n as u32,
                _ => return Err(unencodable(inst, "invalid VOP1 destination")),
            };
            let src0 = encode_src(inst, &inst.operands[1])?;
            let word = (0b0111111u32 << 25) | (vdst << 17) | (op.field() << 9) | src0.field;
            push_words(&mut out, &[word], src0.literal);
        }
        Opcode::Vop2(op) => {
            let vdst = vgpr_field(inst, reg_of(inst, 0)?)?;
            let src0 = encode_src(inst, &inst.operands[1])?;
            let vsrc1 = vgpr_field(inst, reg_of(inst, 2)?)?;
            let word = (op.field() << 25) | (vdst << 17) | (vsrc1 << 9) | src0.field;
            push_words(&mut out, &[word], src0.literal);
        }
        Opcode::Vop3(op) => {
            let dst = reg_of(inst, 0)?;
            let dst_field = match (op, dst) {
                // readlane writes the scalar file, including VCC and M0
                (Vop3Op::V_READLANE_B32, d) if d.bank() != super::operand::RegBank::Vector => d
                    .encoding_index()
                    .filter(|idx| *idx < 256)
                    .ok_or_else(|| unencodable(inst, "invalid readlane destination"))?
                    as u32,
                (_, PhysReg::Vgpr(n)) => n as u32,
                _ => return Err(unencodable(inst, "invalid VOP3 destination")),
            };
            let src_count = super::decoder::vop3_src_count(op);
            if inst.operands.len() != 1 + src_count {
                return Err(unencodable(inst, "wrong VOP3 operand count"));
            }
            let mut fields = [0u32; 3];
            let mut literal = None;
            for i in 0..src_count {
                let src = encode_src(inst, &inst.operands[1 + i])?;
                if src.literal.is_some() {
                    if literal.is_some() {
                        return Err(unencodable(inst, "two literal operands"));
                    }
                    literal = src.literal;
                }
                fields[i] = src.field;
            }
            let word0 = (0b110100u32 << 26) | (op.field() << 16) | dst_field;
            let word1 = (fields[2] << 18) | (fields[1] << 9) | fields[0];
            push_words(&mut out, &[word0, word1], literal);
        }
        Opcode::Flat(op, seg) => {
            let offset = *inst
                .operands
                .last()
                .and_then(|o| match o {
                    InstOperand::Imm(v) => Some(v),
                    _ => None,
                })
                .ok_or_else(|| unencodable(inst, "missing offset"))?;
            if !(0..1 << 13).contains(&offset) {
                return Err(unencodable(inst, "flat offset out of range"));
            }
            let word0 = (0b110111u32 << 26)
                | (op.field() << 18)
                | ((seg as u32) << 14)
                | offset as u32;
            let word1 = if inst.opcode.def_count() == 0 {
                let addr = vgpr_field(inst, reg_of(inst, 0)?)?;
                let data = vgpr_field(inst, reg_of(inst, 1)?)?;
                (data << 8) | addr
            } else {
                let vdst = vgpr_field(inst, reg_of(inst, 0)?)?;
                let addr = vgpr_field(inst, reg_of(inst, 1)?)?;
                (vdst << 24) | addr
            };
            push_words(&mut out, &[word0, word1], None);
        }
        Opcode::Pseudo(_) => {
            return Err(unencodable(inst, "pseudo opcodes have no machine encoding"))
        }
    }
    Ok(out)
}

/// Encodes a full instruction sequence.
pub fn encode_all<'a>(insts: impl IntoIterator<Item = &'a Inst>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for inst in insts {
        out.extend(encode(inst)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_pseudo() {
        let copy = Inst::new(Opcode::Pseudo(PseudoOp::Copy));
        assert!(encode(&copy).is_err());
    }

    #[test]
    fn rejects_double_literal() {
        let inst = Inst::with_operands(
            Opcode::Sop2(Sop2Op::S_ADD_U32),
            [
                InstOperand::Reg(PhysReg::Sgpr(0)),
                InstOperand::Imm(0x1000),
                InstOperand::Imm(0x2000),
            ],
        );
        assert!(encode(&inst).is_err());
    }

    #[test]
    fn negative_inline_constant() {
        let inst = Inst::with_operands(
            Opcode::Sop2(Sop2Op::S_ADD_U32),
            [
                InstOperand::Reg(PhysReg::Sgpr(0)),
                InstOperand::Reg(PhysReg::Sgpr(0)),
                InstOperand::Imm(-4),
            ],
        );
        let bytes = encode(&inst).unwrap();
        assert_eq!(bytes.len(), 4);
    }
}
