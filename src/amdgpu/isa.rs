//! ISA identifiers and their ELF encoding.
//!
//! An ISA is named by the runtime as a full target string such as
//! `amdgcn-amd-amdhsa--gfx908:sramecc+:xnack-`. Inside a code object the
//! same information lives in the ELF header: the architecture id in the low
//! byte of `e_flags`, feature bits above it (encoding depends on the ABI
//! version in `e_ident[EI_ABIVERSION]`).

use crate::error::{Error, Result};
use std::fmt;

/// Tri-state for a target feature that can be on, off, or unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Feature {
    #[default]
    Unspecified,
    Any,
    Off,
    On,
}

impl Feature {
    fn suffix(self, name: &str) -> Option<String> {
        match self {
            Feature::Unspecified => None,
            Feature::Any => Some(name.to_string()),
            Feature::Off => Some(format!("{name}-")),
            Feature::On => Some(format!("{name}+")),
        }
    }
}

/// A parsed ISA identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Isa {
    /// Processor name, e.g. `gfx908`.
    pub gfx_arch: String,
    pub xnack: Feature,
    pub sramecc: Feature,
}

impl Isa {
    /// Parses a full `amdgcn-amd-amdhsa--gfxNNN[:feature±]*` target string,
    /// or a bare processor name.
    pub fn parse(name: &str) -> Result<Self> {
        let proc_part = match name.rsplit("--").next() {
            Some(p) if !p.is_empty() => p,
            _ => name,
        };
        let mut fields = proc_part.split(':');
        let gfx_arch = fields.next().unwrap_or_default().to_string();
        if !gfx_arch.starts_with("gfx") {
            return Err(Error::Target {
                isa: name.to_string(),
            });
        }
        let mut isa = Isa {
            gfx_arch,
            xnack: Feature::Unspecified,
            sramecc: Feature::Unspecified,
        };
        for field in fields {
            match field {
                "xnack+" => isa.xnack = Feature::On,
                "xnack-" => isa.xnack = Feature::Off,
                "sramecc+" => isa.sramecc = Feature::On,
                "sramecc-" => isa.sramecc = Feature::Off,
                other => {
                    return Err(Error::Target {
                        isa: format!("{name} (unknown feature {other:?})"),
                    })
                }
            }
        }
        Ok(isa)
    }

    /// Reconstructs the full target string.
    pub fn target_string(&self) -> String {
        let mut out = format!("amdgcn-amd-amdhsa--{}", self.gfx_arch);
        for feat in [self.xnack.suffix("xnack"), self.sramecc.suffix("sramecc")]
            .into_iter()
            .flatten()
        {
            out.push(':');
            out.push_str(&feat);
        }
        out
    }

    /// Decodes the ISA from an ELF header's `e_flags` and ABI version.
    pub fn from_elf_flags(e_flags: u32, abi_version: u8) -> Result<Self> {
        let gfx_arch = gfx_arch_from_elf_flags(e_flags).ok_or_else(|| Error::Target {
            isa: format!("e_flags {e_flags:#x}"),
        })?;
        let (xnack, sramecc) = decode_features(e_flags, abi_version);
        Ok(Isa {
            gfx_arch: gfx_arch.to_string(),
            xnack,
            sramecc,
        })
    }

    /// Encodes this ISA as ELF `e_flags` for the ABI V4+ layout.
    pub fn to_elf_flags(&self) -> Result<u32> {
        let arch_id = elf_arch_id(&self.gfx_arch).ok_or_else(|| Error::Target {
            isa: self.gfx_arch.clone(),
        })?;
        let mut flags = arch_id as u32;
        flags |= match self.xnack {
            Feature::Unspecified => 0x000,
            Feature::Any => 0x100,
            Feature::Off => 0x200,
            Feature::On => 0x300,
        };
        flags |= match self.sramecc {
            Feature::Unspecified => 0x000,
            Feature::Any => 0x400,
            Feature::Off => 0x800,
            Feature::On => 0xc00,
        };
        Ok(flags)
    }

    /// Wavefront width for this processor.
    pub fn wavefront_size(&self) -> u32 {
        // gfx10+ runs wave32 by default; everything the lifter supports in
        // the GCN/CDNA family is wave64.
        if self.gfx_arch.starts_with("gfx1") && self.gfx_arch.len() > 5 {
            32
        } else {
            64
        }
    }

    /// Whether the decoder supports this processor's encoding family.
    pub fn is_supported(&self) -> bool {
        matches!(
            self.gfx_arch.as_str(),
            "gfx900" | "gfx902" | "gfx904" | "gfx906" | "gfx908" | "gfx909" | "gfx90a" | "gfx90c"
                | "gfx940" | "gfx941" | "gfx942"
        )
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.target_string())
    }
}

/// Maps ELF e_flags to a gfx processor name.
///
/// The architecture id is stored in the low 8 bits of e_flags.
fn gfx_arch_from_elf_flags(e_flags: u32) -> Option<&'static str> {
    let arch_id = (e_flags & 0xff) as u8;
    Some(match arch_id {
        0x02c => "gfx900",
        0x02d => "gfx902",
        0x02e => "gfx904",
        0x02f => "gfx906",
        0x030 => "gfx908",
        0x031 => "gfx909",
        0x032 => "gfx90c",
        0x03f => "gfx90a",
        0x040 => "gfx940",
        0x04b => "gfx941",
        0x04c => "gfx942",
        0x033 => "gfx1010",
        0x036 => "gfx1030",
        0x041 => "gfx1100",
        _ => return None,
    })
}

fn elf_arch_id(gfx_arch: &str) -> Option<u8> {
    Some(match gfx_arch {
        "gfx900" => 0x02c,
        "gfx902" => 0x02d,
        "gfx904" => 0x02e,
        "gfx906" => 0x02f,
        "gfx908" => 0x030,
        "gfx909" => 0x031,
        "gfx90c" => 0x032,
        "gfx90a" => 0x03f,
        "gfx940" => 0x040,
        "gfx941" => 0x04b,
        "gfx942" => 0x04c,
        "gfx1010" => 0x033,
        "gfx1030" => 0x036,
        "gfx1100" => 0x041,
        _ => return None,
    })
}

/// Decodes xnack/sramecc from e_flags. The encoding varies by ABI version.
fn decode_features(e_flags: u32, abi_version: u8) -> (Feature, Feature) {
    match abi_version {
        0 => {
            // ABI V2: single flag at bit 0
            let xnack = if e_flags & 0x01 != 0 {
                Feature::On
            } else {
                Feature::Unspecified
            };
            (xnack, Feature::Unspecified)
        }
        1 => {
            // ABI V3: boolean flags at 0x100 and 0x200
            let xnack = if e_flags & 0x100 != 0 {
                Feature::On
            } else {
                Feature::Unspecified
            };
            let sramecc = if e_flags & 0x200 != 0 {
                Feature::On
            } else {
                Feature::Unspecified
            };
            (xnack, sramecc)
        }
        _ => {
            // ABI V4+: 2-bit fields
            let xnack = match e_flags & 0x300 {
                0x100 => Feature::Any,
                0x200 => Feature::Off,
                0x300 => Feature::On,
                _ => Feature::Unspecified,
            };
            let sramecc = match e_flags & 0xc00 {
                0x400 => Feature::Any,
                0x800 => Feature::Off,
                0xc00 => Feature::On,
                _ => Feature::Unspecified,
            };
            (xnack, sramecc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_target_string() {
        let isa = Isa::parse("amdgcn-amd-amdhsa--gfx908:sramecc+:xnack-").unwrap();
        assert_eq!(isa.gfx_arch, "gfx908");
        assert_eq!(isa.sramecc, Feature::On);
        assert_eq!(isa.xnack, Feature::Off);
        assert_eq!(
            isa.target_string(),
            "amdgcn-amd-amdhsa--gfx908:xnack-:sramecc+"
        );
    }

    #[test]
    fn parse_bare_processor() {
        let isa = Isa::parse("gfx90a").unwrap();
        assert_eq!(isa.gfx_arch, "gfx90a");
        assert_eq!(isa.wavefront_size(), 64);
        assert!(isa.is_supported());
    }

    #[test]
    fn rejects_non_gfx() {
        assert!(Isa::parse("x86_64-unknown-linux").is_err());
    }

    #[test]
    fn elf_flags_round_trip() {
        let isa = Isa::parse("gfx908:sramecc+:xnack-").unwrap();
        let flags = isa.to_elf_flags().unwrap();
        let back = Isa::from_elf_flags(flags, 2).unwrap();
        assert_eq!(isa, back);
    }

    #[test]
    fn abi_v3_feature_bits() {
        // arch id for gfx906 with the V3 xnack bit set
        let isa = Isa::from_elf_flags(0x12f, 1).unwrap();
        assert_eq!(isa.gfx_arch, "gfx906");
        assert_eq!(isa.xnack, Feature::On);
    }
}
