//! Read-side view over an AMD GCN code object.
//!
//! Thin wrapper around [`object::File`] that knows the AMDGPU specifics:
//! the ISA encoded in `e_flags`, kernel-descriptor symbols, the metadata
//! section, and the AMDGPU relocation types.

use super::isa::Isa;
use super::metadata::{self, KernelMetadata};
use crate::error::{Error, Result};
use object::{
    File, FileFlags, Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationFlags,
    RelocationTarget, SectionIndex, SectionKind, SymbolKind, SymbolSection,
};
use std::collections::HashMap;

/// ELF machine number for AMDGPU.
pub const EM_AMDGPU: u16 = 224;

/// Section carrying the kernel metadata document.
pub const METADATA_SECTION: &str = ".amdgpu_metadata";

/// AMDGPU ELF relocation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    Abs32Lo,
    Abs32Hi,
    Abs64,
    Rel32,
    Rel64,
    Abs32,
    Rel32Lo,
    Rel32Hi,
}

impl RelocKind {
    pub fn from_elf(r_type: u32) -> Option<Self> {
        Some(match r_type {
            1 => RelocKind::Abs32Lo,
            2 => RelocKind::Abs32Hi,
            3 => RelocKind::Abs64,
            4 => RelocKind::Rel32,
            5 => RelocKind::Rel64,
            6 => RelocKind::Abs32,
            10 => RelocKind::Rel32Lo,
            11 => RelocKind::Rel32Hi,
            _ => return None,
        })
    }

    pub fn to_elf(self) -> u32 {
        match self {
            RelocKind::Abs32Lo => 1,
            RelocKind::Abs32Hi => 2,
            RelocKind::Abs64 => 3,
            RelocKind::Rel32 => 4,
            RelocKind::Rel64 => 5,
            RelocKind::Abs32 => 6,
            RelocKind::Rel32Lo => 10,
            RelocKind::Rel32Hi => 11,
        }
    }
}

/// One relocation record, file-address keyed.
#[derive(Debug, Clone, PartialEq)]
pub struct RelocRecord {
    /// Virtual address of the patched location in the file image.
    pub address: u64,
    pub kind: RelocKind,
    /// Name of the referenced symbol.
    pub symbol: String,
    pub addend: i64,
}

/// A symbol as seen in the ELF symbol table.
#[derive(Debug, Clone, PartialEq)]
pub struct ElfSymbolRecord {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub is_global: bool,
    pub is_undefined: bool,
}

/// Parsed view over the raw ELF bytes of a code object.
///
/// Loaded shared objects carry real virtual addresses. Relocatable objects
/// (the printer's output) do not, so parsing assigns each allocatable
/// section a canonical address — the same layout the loader uses when
/// placing the object in device memory — and every address-based query
/// goes through that layout.
pub struct AmdGcnObjectFile<'data> {
    file: File<'data>,
    /// Canonical section base addresses; empty for non-relocatables.
    layout: HashMap<SectionIndex, u64>,
    image_size: u64,
}

fn is_alloc(kind: SectionKind) -> bool {
    matches!(
        kind,
        SectionKind::Text
            | SectionKind::Data
            | SectionKind::ReadOnlyData
            | SectionKind::ReadOnlyString
            | SectionKind::UninitializedData
    )
}

impl<'data> AmdGcnObjectFile<'data> {
    /// Parses a code object. Accepts any ELF whose `e_flags` carry a known
    /// AMDGPU architecture id; relocatables printed by the code generator
    /// are accepted on the same basis.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let file = File::parse(data)?;
        let mut layout = HashMap::new();
        let mut image_size = 0u64;
        if file.kind() == ObjectKind::Relocatable {
            let mut cursor = 0u64;
            for section in file.sections() {
                if !is_alloc(section.kind()) {
                    continue;
                }
                let align = section.align().max(1);
                cursor = cursor.div_ceil(align) * align;
                layout.insert(section.index(), cursor);
                cursor += section.size();
            }
            image_size = cursor;
        } else {
            for section in file.sections() {
                if is_alloc(section.kind()) {
                    image_size = image_size.max(section.address() + section.size());
                }
            }
        }
        let this = AmdGcnObjectFile {
            file,
            layout,
            image_size,
        };
        this.isa()?; // reject files without a recognisable target
        Ok(this)
    }

    /// Size of the loaded image under the canonical layout.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Base address of a section under the canonical layout.
    pub fn section_base(&self, index: SectionIndex) -> Option<u64> {
        if let Some(base) = self.layout.get(&index) {
            return Some(*base);
        }
        let section = self.file.section_by_index(index).ok()?;
        is_alloc(section.kind()).then(|| section.address())
    }

    fn elf_flags(&self) -> Result<(u32, u8)> {
        match self.file.flags() {
            FileFlags::Elf {
                e_flags,
                abi_version,
                ..
            } => Ok((e_flags, abi_version)),
            _ => Err(Error::Object("not an ELF file".into())),
        }
    }

    /// The ISA this code object was compiled for.
    pub fn isa(&self) -> Result<Isa> {
        let (e_flags, abi_version) = self.elf_flags()?;
        Isa::from_elf_flags(e_flags, abi_version)
    }

    /// All symbol-table entries, addresses resolved through the canonical
    /// layout.
    pub fn symbols(&self) -> Vec<ElfSymbolRecord> {
        self.file
            .symbols()
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                let mut address = sym.address();
                if let SymbolSection::Section(idx) = sym.section() {
                    if let Some(base) = self.layout.get(&idx) {
                        address += base;
                    }
                }
                Some(ElfSymbolRecord {
                    name: name.to_string(),
                    address,
                    size: sym.size(),
                    kind: sym.kind(),
                    is_global: sym.is_global(),
                    is_undefined: sym.is_undefined(),
                })
            })
            .collect()
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<ElfSymbolRecord> {
        self.symbols().into_iter().find(|s| s.name == name)
    }

    /// Bytes of the file image at (canonical) virtual address `addr`.
    pub fn bytes_at(&self, addr: u64, len: u64) -> Result<&'data [u8]> {
        for section in self.file.sections() {
            let Some(start) = self.section_base(section.index()) else {
                continue;
            };
            let size = section.size();
            if addr >= start && addr + len <= start + size {
                let data = section.data()?;
                let begin = (addr - start) as usize;
                // NOBITS sections have no file data
                if begin + len as usize > data.len() {
                    break;
                }
                return Ok(&data[begin..begin + len as usize]);
            }
        }
        Err(Error::Object(format!(
            "no section data for address range {addr:#x}+{len:#x}"
        )))
    }

    /// Scans every relocation section into flat records.
    pub fn relocations(&self) -> Vec<RelocRecord> {
        let mut out = Vec::new();
        for section in self.file.sections() {
            for (offset, reloc) in section.relocations() {
                let r_type = match reloc.flags() {
                    RelocationFlags::Elf { r_type } => r_type,
                    _ => continue,
                };
                let Some(kind) = RelocKind::from_elf(r_type) else {
                    log::warn!(
                        "skipping relocation with unknown type {r_type} at {offset:#x}"
                    );
                    continue;
                };
                let symbol = match reloc.target() {
                    RelocationTarget::Symbol(idx) => self
                        .file
                        .symbol_by_index(idx)
                        .ok()
                        .and_then(|s| s.name().ok().map(str::to_string)),
                    _ => None,
                };
                let Some(symbol) = symbol else { continue };
                let Some(base) = self.section_base(section.index()) else {
                    continue;
                };
                out.push(RelocRecord {
                    address: base + offset,
                    kind,
                    symbol,
                    addend: reloc.addend(),
                });
            }
        }
        out
    }

    /// Parses the kernel metadata document, empty when the section is
    /// absent.
    pub fn kernel_metadata(&self) -> Result<Vec<KernelMetadata>> {
        let Some(section) = self.file.section_by_name(METADATA_SECTION) else {
            return Ok(Vec::new());
        };
        let data = section.data()?;
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Object("metadata section is not UTF-8".into()))?;
        metadata::parse_metadata(text)
    }

    pub fn inner(&self) -> &File<'data> {
        &self.file
    }
}

/// `.kd` suffix identifying kernel-descriptor symbols.
pub const KD_SUFFIX: &str = ".kd";

/// Returns the kernel name when `symbol_name` is a kernel-descriptor
/// symbol.
pub fn kernel_name_from_descriptor(symbol_name: &str) -> Option<&str> {
    symbol_name.strip_suffix(KD_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_name_stripping() {
        assert_eq!(kernel_name_from_descriptor("foo.kd"), Some("foo"));
        assert_eq!(kernel_name_from_descriptor("foo"), None);
    }

    #[test]
    fn reloc_kind_round_trip() {
        for kind in [
            RelocKind::Abs32Lo,
            RelocKind::Abs32Hi,
            RelocKind::Abs64,
            RelocKind::Rel32,
            RelocKind::Rel64,
            RelocKind::Abs32,
            RelocKind::Rel32Lo,
            RelocKind::Rel32Hi,
        ] {
            assert_eq!(RelocKind::from_elf(kind.to_elf()), Some(kind));
        }
        assert_eq!(RelocKind::from_elf(99), None);
    }
}
