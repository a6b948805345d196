//! Printing machine IR back to bytes.
//!
//! The relocatable printer encodes every function, lays blocks out in
//! order, fixes up intra-function branch displacements, emits one kernel
//! descriptor per kernel into `.rodata`, re-renders the metadata
//! document, and records relocations for every symbolic operand. Globals
//! are emitted as undefined symbols: the loader defines them at their
//! already-loaded addresses.

use crate::amdgpu::object::{EM_AMDGPU, METADATA_SECTION};
use crate::amdgpu::{
    branch, encoder, metadata, Inst, InstOperand, KernelMetadata, Opcode, RelocKind, SopkOp,
};
use crate::error::{Error, Result};
use crate::lifter::LiftedRepresentation;
use crate::mir::{MachFunction, MachOperand, MbbId};
use object::write::{
    Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, FileFlags, RelocationFlags, SymbolFlags, SymbolKind,
    SymbolScope,
};
use std::collections::HashMap;

/// Output flavours of the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// A relocatable ELF object.
    Relocatable,
    /// A textual listing.
    Assembly,
}

/// Prints the representation; bytes for [`FileType::Relocatable`], UTF-8
/// text for [`FileType::Assembly`].
pub fn print(lr: &LiftedRepresentation, file_type: FileType) -> Result<Vec<u8>> {
    match file_type {
        FileType::Relocatable => print_relocatable(lr),
        FileType::Assembly => Ok(print_assembly(lr).into_bytes()),
    }
}

/// Renders a textual listing of every function.
pub fn print_assembly(lr: &LiftedRepresentation) -> String {
    let mut out = String::new();
    for func in &lr.mir.functions {
        out.push_str(&format!("{}:\n", func.name));
        for block in &func.blocks {
            out.push_str(&format!("{}:\n", block.id));
            for inst in &block.insts {
                out.push_str(&format!("    {inst}\n"));
            }
        }
        out.push('\n');
    }
    out
}

struct PendingReloc {
    text_offset: u64,
    symbol: String,
    kind: RelocKind,
    addend: i64,
}

/// Prints a relocatable ELF object.
pub fn print_relocatable(lr: &LiftedRepresentation) -> Result<Vec<u8>> {
    // the writer has no AMDGPU architecture; emit under a stand-in and
    // stamp the real e_machine into the header afterwards
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    obj.flags = FileFlags::Elf {
        os_abi: 64, // AMDGPU HSA
        abi_version: 2,
        e_flags: lr.isa.to_elf_flags()?,
    };

    let text = obj.section_id(StandardSection::Text);
    let rodata = obj.section_id(StandardSection::ReadOnlyData);

    let mut symbol_ids: HashMap<String, SymbolId> = HashMap::new();
    let mut pending: Vec<PendingReloc> = Vec::new();
    let mut kernels: Vec<KernelMetadata> = Vec::new();

    let mut text_bytes: Vec<u8> = Vec::new();
    let mut func_ranges: Vec<(String, u64, u64, bool)> = Vec::new();
    let mut call_fixups: Vec<(u64, String)> = Vec::new();

    for func in &lr.mir.functions {
        // kernel entry points are cache-line aligned
        let align = if func.is_kernel { 256 } else { 4 };
        let misalign = text_bytes.len() % align;
        if misalign != 0 {
            let pad = align - misalign;
            for _ in 0..pad / 4 {
                text_bytes.extend_from_slice(&encoder::encode(&nop())?);
            }
        }
        let start = text_bytes.len() as u64;
        encode_function(func, &mut text_bytes, &mut pending, &mut call_fixups)?;
        let size = text_bytes.len() as u64 - start;
        func_ranges.push((func.name.clone(), start, size, func.is_kernel));
    }

    // direct calls to sibling functions resolve to displacements once the
    // layout is final
    for (call_offset, target) in call_fixups {
        let (_, start, _, _) = func_ranges
            .iter()
            .find(|(name, ..)| *name == target)
            .ok_or_else(|| {
                Error::codegen(format!("call targets unknown function `{target}`"))
            })?;
        let simm = branch::branch_displacement(call_offset, *start).ok_or_else(|| {
            Error::codegen(format!("call displacement to `{target}` out of range"))
        })?;
        let at = call_offset as usize;
        text_bytes[at..at + 2].copy_from_slice(&(simm as u16).to_le_bytes());
    }

    let text_off = obj.append_section_data(text, &text_bytes, 256);
    debug_assert_eq!(text_off, 0);

    // function symbols
    for (name, start, size, _) in &func_ranges {
        let id = obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: *start,
            size: *size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        symbol_ids.insert(name.clone(), id);
    }

    // kernel descriptors and metadata
    for func in &lr.mir.functions {
        if !func.is_kernel {
            continue;
        }
        let kd = func.descriptor.clone().ok_or_else(|| {
            Error::codegen(format!("kernel `{}` lost its descriptor", func.name))
        })?;
        let kd_off = obj.append_section_data(rodata, &kd.to_bytes(), 64);
        let kd_name = format!("{}.kd", func.name);
        let kd_id = obj.add_symbol(Symbol {
            name: kd_name.as_bytes().to_vec(),
            value: kd_off,
            size: 64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(rodata),
            flags: SymbolFlags::None,
        });
        symbol_ids.insert(kd_name, kd_id);

        // the descriptor's entry offset field points at the kernel code
        let func_sym = symbol_ids[&func.name];
        obj.add_relocation(
            rodata,
            Relocation {
                offset: kd_off + 16,
                symbol: func_sym,
                addend: 16,
                flags: RelocationFlags::Elf {
                    r_type: RelocKind::Rel64.to_elf(),
                },
            },
        )?;

        let metadata = kernel_metadata_for(lr, func, &kd);
        kernels.push(metadata);
    }

    // every referenced global becomes an undefined symbol; the loader
    // defines them at their loaded addresses
    for reloc in &pending {
        if !symbol_ids.contains_key(&reloc.symbol) {
            let id = obj.add_symbol(Symbol {
                name: reloc.symbol.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Data,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
            symbol_ids.insert(reloc.symbol.clone(), id);
        }
    }
    for reloc in pending {
        let symbol = symbol_ids[&reloc.symbol];
        obj.add_relocation(
            text,
            Relocation {
                offset: reloc.text_offset,
                symbol,
                addend: reloc.addend,
                flags: RelocationFlags::Elf {
                    r_type: reloc.kind.to_elf(),
                },
            },
        )?;
    }

    // metadata document
    let metadata_text = metadata::write_metadata(&kernels);
    let metadata_section = obj.add_section(
        Vec::new(),
        METADATA_SECTION.as_bytes().to_vec(),
        object::SectionKind::Other,
    );
    obj.append_section_data(metadata_section, metadata_text.as_bytes(), 1);

    let mut bytes = obj.write()?;
    stamp_machine(&mut bytes);
    Ok(bytes)
}

/// Overwrites `e_machine` with the AMDGPU value.
fn stamp_machine(elf: &mut [u8]) {
    if elf.len() >= 20 {
        elf[18..20].copy_from_slice(&EM_AMDGPU.to_le_bytes());
    }
}

fn nop() -> Inst {
    Inst::with_operands(
        Opcode::Sopp(crate::amdgpu::SoppOp::S_NOP),
        [InstOperand::Imm(0)],
    )
}

fn kernel_metadata_for(
    lr: &LiftedRepresentation,
    func: &MachFunction,
    kd: &crate::amdgpu::KernelDescriptor,
) -> KernelMetadata {
    let base = lr
        .symbol_of_function(&func.name)
        .and_then(|s| s.as_kernel().map(|k| k.metadata.clone()))
        .unwrap_or_default();
    KernelMetadata {
        name: func.name.clone(),
        symbol: format!("{}.kd", func.name),
        kernarg_segment_size: if base.kernarg_segment_size != 0 {
            base.kernarg_segment_size
        } else {
            kd.kernarg_size
        },
        private_segment_fixed_size: kd.private_segment_fixed_size,
        group_segment_fixed_size: kd.group_segment_fixed_size,
        sgpr_count: kd.sgpr_count(),
        vgpr_count: kd.vgpr_count(),
        wavefront_size: lr.isa.wavefront_size(),
        args: base.args,
    }
}

/// Encodes one function, recording relocations and fixing up branches.
fn encode_function(
    func: &MachFunction,
    out: &mut Vec<u8>,
    pending: &mut Vec<PendingReloc>,
    call_fixups: &mut Vec<(u64, String)>,
) -> Result<()> {
    let func_base = out.len() as u64;
    let mut block_offsets: HashMap<MbbId, u64> = HashMap::new();
    // (byte offset of branch word, target block)
    let mut branch_fixups: Vec<(u64, MbbId)> = Vec::new();

    for block in &func.blocks {
        block_offsets.insert(block.id, out.len() as u64 - func_base);
        for mi in &block.insts {
            // calls to sibling functions keep a displacement fixup
            if mi.opcode == Opcode::Sopk(SopkOp::S_CALL_B64) {
                if let Some(MachOperand::Global(g)) = mi.operands.get(1) {
                    let dst = mi
                        .operands
                        .first()
                        .and_then(|op| op.as_reg())
                        .and_then(|r| r.reg.as_phys())
                        .ok_or_else(|| {
                            Error::codegen("call lost its link register".to_string())
                        })?;
                    call_fixups.push((out.len() as u64, g.name.clone()));
                    let call = Inst::with_operands(
                        mi.opcode,
                        [InstOperand::Reg(dst), InstOperand::Imm(0)],
                    );
                    out.extend_from_slice(&encoder::encode(&call)?);
                    continue;
                }
            }
            let (inst, fixup, has_reloc) = lower_inst(mi, pending)?;
            let bytes = encoder::encode(&inst)?;
            if let Some(target) = fixup {
                branch_fixups.push((out.len() as u64 - func_base, target));
            }
            if has_reloc {
                // the literal trails the instruction words
                let literal_at = out.len() as u64 + bytes.len() as u64 - 4;
                if let Some(p) = pending.last_mut() {
                    if p.text_offset == u64::MAX {
                        p.text_offset = literal_at;
                    }
                }
            }
            out.extend_from_slice(&bytes);
        }
    }

    // patch branch displacements now that block offsets are known
    for (branch_offset, target) in branch_fixups {
        let target_offset = *block_offsets.get(&target).ok_or_else(|| {
            Error::codegen(format!("branch targets unknown block {target}"))
        })?;
        let simm = branch::branch_displacement(branch_offset, target_offset).ok_or_else(|| {
            Error::codegen(format!(
                "branch displacement to {target} out of range"
            ))
        })?;
        let at = (func_base + branch_offset) as usize;
        out[at..at + 2].copy_from_slice(&(simm as u16).to_le_bytes());
    }
    Ok(())
}

fn lower_inst(
    mi: &crate::mir::MachInst,
    pending: &mut Vec<PendingReloc>,
) -> Result<(Inst, Option<MbbId>, bool)> {
    if let Opcode::Pseudo(p) = mi.opcode {
        return Err(Error::codegen(format!(
            "pseudo instruction {p:?} survived to printing"
        )));
    }

    let mut inst = Inst::new(mi.opcode);
    let mut fixup = None;
    let mut has_reloc = false;
    for op in &mi.operands {
        match op {
            MachOperand::Reg(r) => {
                if r.is_implicit {
                    continue;
                }
                let phys = r.reg.as_phys().ok_or_else(|| {
                    Error::codegen(format!(
                        "virtual register {} survived allocation in `{mi}`",
                        r.reg
                    ))
                })?;
                inst.operands.push(InstOperand::Reg(phys));
            }
            MachOperand::Imm(v) => inst.operands.push(InstOperand::Imm(*v)),
            MachOperand::FImm(v) => inst.operands.push(InstOperand::FImm(*v)),
            MachOperand::Block(target) => {
                // placeholder displacement; patched after layout
                fixup = Some(*target);
                inst.operands.push(InstOperand::Imm(0));
            }
            MachOperand::Global(g) => {
                // only encodings with a trailing literal can carry a
                // symbolic operand
                if matches!(
                    mi.opcode,
                    Opcode::Sopk(_) | Opcode::Sopp(_) | Opcode::Smem(_) | Opcode::Flat(..)
                ) {
                    // s_call is handled by the caller via displacement
                    // fixups; anything else here has nowhere to put the
                    // reference
                    return Err(Error::codegen(format!(
                        "`{mi}` cannot carry a symbolic operand; no literal slot"
                    )));
                }
                // forced literal slot, patched by the loader's relocation
                has_reloc = true;
                pending.push(PendingReloc {
                    text_offset: u64::MAX, // filled in by the caller
                    symbol: g.name.clone(),
                    kind: g.kind.unwrap_or(RelocKind::Abs32),
                    addend: g.addend,
                });
                inst.operands.push(InstOperand::Imm(0x7fff_ffff));
            }
        }
    }
    Ok((inst, fixup, has_reloc))
}
