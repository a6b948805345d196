//! Kernel metadata carried in the code object's metadata note.
//!
//! The document is the `amdhsa.kernels` mapping: one entry per kernel with
//! its kernarg layout and register usage. Parsing is a line-oriented
//! scrape of the YAML text; only the fields the instrumentation core needs
//! are extracted.

use crate::error::{Error, Result};

/// What a kernarg slot holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValueKind {
    ByValue,
    GlobalBuffer,
    DynamicSharedPointer,
    HiddenGlobalOffsetX,
    HiddenGlobalOffsetY,
    HiddenGlobalOffsetZ,
    HiddenBlockCountX,
    HiddenBlockCountY,
    HiddenBlockCountZ,
    HiddenQueuePtr,
    Other(String),
}

impl ArgValueKind {
    fn parse(s: &str) -> Self {
        match s {
            "by_value" => ArgValueKind::ByValue,
            "global_buffer" => ArgValueKind::GlobalBuffer,
            "dynamic_shared_pointer" => ArgValueKind::DynamicSharedPointer,
            "hidden_global_offset_x" => ArgValueKind::HiddenGlobalOffsetX,
            "hidden_global_offset_y" => ArgValueKind::HiddenGlobalOffsetY,
            "hidden_global_offset_z" => ArgValueKind::HiddenGlobalOffsetZ,
            "hidden_block_count_x" => ArgValueKind::HiddenBlockCountX,
            "hidden_block_count_y" => ArgValueKind::HiddenBlockCountY,
            "hidden_block_count_z" => ArgValueKind::HiddenBlockCountZ,
            "hidden_queue_ptr" => ArgValueKind::HiddenQueuePtr,
            other => ArgValueKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ArgValueKind::ByValue => "by_value",
            ArgValueKind::GlobalBuffer => "global_buffer",
            ArgValueKind::DynamicSharedPointer => "dynamic_shared_pointer",
            ArgValueKind::HiddenGlobalOffsetX => "hidden_global_offset_x",
            ArgValueKind::HiddenGlobalOffsetY => "hidden_global_offset_y",
            ArgValueKind::HiddenGlobalOffsetZ => "hidden_global_offset_z",
            ArgValueKind::HiddenBlockCountX => "hidden_block_count_x",
            ArgValueKind::HiddenBlockCountY => "hidden_block_count_y",
            ArgValueKind::HiddenBlockCountZ => "hidden_block_count_z",
            ArgValueKind::HiddenQueuePtr => "hidden_queue_ptr",
            ArgValueKind::Other(s) => s,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.as_str().starts_with("hidden_")
    }
}

/// One kernarg slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    pub name: Option<String>,
    pub size: u32,
    pub offset: u32,
    pub value_kind: ArgValueKind,
}

/// Metadata for one kernel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelMetadata {
    pub name: String,
    pub symbol: String,
    pub kernarg_segment_size: u32,
    pub private_segment_fixed_size: u32,
    pub group_segment_fixed_size: u32,
    pub sgpr_count: u32,
    pub vgpr_count: u32,
    pub wavefront_size: u32,
    pub args: Vec<KernelArg>,
}

impl KernelMetadata {
    /// Byte offset of the first hidden argument, if any.
    pub fn hidden_args_offset(&self) -> Option<u32> {
        self.args
            .iter()
            .filter(|a| a.value_kind.is_hidden())
            .map(|a| a.offset)
            .min()
    }
}

/// Parses the metadata document text into per-kernel records.
pub fn parse_metadata(text: &str) -> Result<Vec<KernelMetadata>> {
    let mut kernels: Vec<KernelMetadata> = Vec::new();
    let mut in_kernels = false;
    let mut in_args = false;

    for raw in text.lines() {
        let line = raw.trim_end();
        if line.trim() == "amdhsa.kernels:" {
            in_kernels = true;
            continue;
        }
        if !in_kernels {
            continue;
        }
        // a non-indented key ends the kernels mapping
        if !line.starts_with(' ') && line.contains(':') {
            in_kernels = false;
            continue;
        }

        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if trimmed.starts_with("- ") && indent <= 2 {
            kernels.push(KernelMetadata {
                wavefront_size: 64,
                ..Default::default()
            });
            in_args = false;
            // fall through: the dash line may carry the first key
        }
        let entry = trimmed.trim_start_matches("- ").trim();
        if entry == ".args:" {
            in_args = true;
            continue;
        }
        let Some((key, value)) = entry.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('\'').trim_matches('"');
        let kernel = kernels
            .last_mut()
            .ok_or_else(|| Error::Object("metadata entry outside a kernel".into()))?;

        if in_args && trimmed.starts_with("- ") && indent >= 6 {
            kernel.args.push(KernelArg {
                name: None,
                size: 0,
                offset: 0,
                value_kind: ArgValueKind::Other(String::new()),
            });
        }

        let parse_u32 = |v: &str| -> Result<u32> {
            v.parse::<u32>()
                .map_err(|_| Error::Object(format!("bad metadata integer {v:?} for {key}")))
        };

        if in_args && indent >= 6 {
            let arg = kernel
                .args
                .last_mut()
                .ok_or_else(|| Error::Object("argument field outside an argument".into()))?;
            match key {
                ".name" => arg.name = Some(value.to_string()),
                ".size" => arg.size = parse_u32(value)?,
                ".offset" => arg.offset = parse_u32(value)?,
                ".value_kind" => arg.value_kind = ArgValueKind::parse(value),
                _ => {}
            }
        } else {
            in_args = false;
            match key {
                ".name" => kernel.name = value.to_string(),
                ".symbol" => kernel.symbol = value.to_string(),
                ".kernarg_segment_size" => kernel.kernarg_segment_size = parse_u32(value)?,
                ".private_segment_fixed_size" => {
                    kernel.private_segment_fixed_size = parse_u32(value)?
                }
                ".group_segment_fixed_size" => {
                    kernel.group_segment_fixed_size = parse_u32(value)?
                }
                ".sgpr_count" => kernel.sgpr_count = parse_u32(value)?,
                ".vgpr_count" => kernel.vgpr_count = parse_u32(value)?,
                ".wavefront_size" => kernel.wavefront_size = parse_u32(value)?,
                _ => {}
            }
        }
    }
    Ok(kernels)
}

/// Renders per-kernel records back into the metadata document.
pub fn write_metadata(kernels: &[KernelMetadata]) -> String {
    let mut out = String::from("amdhsa.kernels:\n");
    for k in kernels {
        out.push_str(&format!("  - .name: {}\n", k.name));
        out.push_str(&format!("    .symbol: {}\n", k.symbol));
        out.push_str(&format!(
            "    .kernarg_segment_size: {}\n",
            k.kernarg_segment_size
        ));
        out.push_str(&format!(
            "    .private_segment_fixed_size: {}\n",
            k.private_segment_fixed_size
        ));
        out.push_str(&format!(
            "    .group_segment_fixed_size: {}\n",
            k.group_segment_fixed_size
        ));
        out.push_str(&format!("    .sgpr_count: {}\n", k.sgpr_count));
        out.push_str(&format!("    .vgpr_count: {}\n", k.vgpr_count));
        out.push_str(&format!("    .wavefront_size: {}\n", k.wavefront_size));
        if !k.args.is_empty() {
            out.push_str("    .args:\n");
            for a in &k.args {
                let mut first = true;
                let mut push_field = |text: String, out: &mut String| {
                    if first {
                        out.push_str(&format!("      - {text}\n"));
                        first = false;
                    } else {
                        out.push_str(&format!("        {text}\n"));
                    }
                };
                if let Some(name) = &a.name {
                    push_field(format!(".name: {name}"), &mut out);
                }
                push_field(format!(".size: {}", a.size), &mut out);
                push_field(format!(".offset: {}", a.offset), &mut out);
                push_field(format!(".value_kind: {}", a.value_kind.as_str()), &mut out);
            }
        }
    }
    out.push_str("amdhsa.version:\n  - 1\n  - 2\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let kernels = vec![KernelMetadata {
            name: "vector_add".into(),
            symbol: "vector_add.kd".into(),
            kernarg_segment_size: 24,
            private_segment_fixed_size: 16,
            group_segment_fixed_size: 0,
            sgpr_count: 16,
            vgpr_count: 8,
            wavefront_size: 64,
            args: vec![
                KernelArg {
                    name: Some("out".into()),
                    size: 8,
                    offset: 0,
                    value_kind: ArgValueKind::GlobalBuffer,
                },
                KernelArg {
                    name: None,
                    size: 8,
                    offset: 16,
                    value_kind: ArgValueKind::HiddenGlobalOffsetX,
                },
            ],
        }];
        let text = write_metadata(&kernels);
        let parsed = parse_metadata(&text).unwrap();
        assert_eq!(parsed, kernels);
    }

    #[test]
    fn hidden_args_offset() {
        let text = write_metadata(&[KernelMetadata {
            name: "k".into(),
            symbol: "k.kd".into(),
            args: vec![
                KernelArg {
                    name: Some("p".into()),
                    size: 8,
                    offset: 0,
                    value_kind: ArgValueKind::GlobalBuffer,
                },
                KernelArg {
                    name: None,
                    size: 8,
                    offset: 8,
                    value_kind: ArgValueKind::HiddenBlockCountX,
                },
            ],
            ..Default::default()
        }]);
        let parsed = parse_metadata(&text).unwrap();
        assert_eq!(parsed[0].hidden_args_offset(), Some(8));
    }

    #[test]
    fn ignores_foreign_top_level_keys() {
        let text = "amdhsa.target: amdgcn\namdhsa.kernels:\n  - .name: k\n    .symbol: k.kd\n";
        let parsed = parse_metadata(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "k");
    }
}
