//! The target manager.
//!
//! Owns one description bundle per GPU ISA: subtarget facts, the opcode
//! and register tables, the instruction analysis (branch evaluation), and
//! the instruction printer. Bundles are built lazily on first request and
//! live for the life of the manager. Target machines for code generation
//! are minted fresh and owned by their consumer.

use crate::amdgpu::{branch, decoder, encoder, inst::Inst, Isa};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Subtarget facts the lifter and code generator consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtargetInfo {
    pub wavefront_size: u32,
    pub max_sgprs: u32,
    pub max_vgprs: u32,
    pub sgpr_granule: u32,
    pub vgpr_granule: u32,
}

impl SubtargetInfo {
    fn for_isa(isa: &Isa) -> SubtargetInfo {
        SubtargetInfo {
            wavefront_size: isa.wavefront_size(),
            max_sgprs: 102,
            max_vgprs: 256,
            sgpr_granule: 8,
            vgpr_granule: 4,
        }
    }
}

/// The per-ISA description bundle.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub isa: Isa,
    pub subtarget: SubtargetInfo,
}

impl TargetInfo {
    /// Decodes a machine-code range into `(instruction, offset)` pairs.
    pub fn disassemble(&self, bytes: &[u8]) -> Result<Vec<decoder::DecodedInst>> {
        decoder::decode_all(bytes)
    }

    /// Encodes one instruction.
    pub fn encode(&self, inst: &Inst) -> Result<Vec<u8>> {
        encoder::encode(inst)
    }

    /// The corrected branch evaluator. See [`branch::evaluate_branch`].
    pub fn evaluate_branch(&self, inst: &Inst, pc: u64, size: u64) -> Option<u64> {
        branch::evaluate_branch(inst, pc, size)
    }
}

/// Codegen options carried by a target machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetOptions {
    pub code_object_version: u32,
}

impl Default for TargetOptions {
    fn default() -> Self {
        TargetOptions {
            code_object_version: 5,
        }
    }
}

/// A codegen handle for one ISA, owned by its consumer.
#[derive(Debug, Clone)]
pub struct TargetMachine {
    pub isa: Isa,
    pub subtarget: SubtargetInfo,
    pub options: TargetOptions,
}

/// Lazy map from ISA to target description bundle.
pub struct TargetManager {
    targets: Mutex<HashMap<Isa, Arc<TargetInfo>>>,
}

impl TargetManager {
    pub fn new() -> Self {
        TargetManager {
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// The description bundle for `isa`, built on first request.
    pub fn target_info(&self, isa: &Isa) -> Result<Arc<TargetInfo>> {
        let mut targets = self.targets.lock().unwrap();
        if let Some(info) = targets.get(isa) {
            return Ok(Arc::clone(info));
        }
        if !isa.is_supported() {
            return Err(Error::Target {
                isa: isa.target_string(),
            });
        }
        log::debug!("building target description for {isa}");
        let info = Arc::new(TargetInfo {
            isa: isa.clone(),
            subtarget: SubtargetInfo::for_isa(isa),
        });
        targets.insert(isa.clone(), Arc::clone(&info));
        Ok(info)
    }

    /// Mints a fresh target machine; the caller owns it.
    pub fn create_target_machine(&self, isa: &Isa) -> Result<TargetMachine> {
        let info = self.target_info(isa)?;
        Ok(TargetMachine {
            isa: info.isa.clone(),
            subtarget: info.subtarget,
            options: TargetOptions::default(),
        })
    }
}

impl Default for TargetManager {
    fn default() -> Self {
        TargetManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundles_are_cached_per_isa() {
        let manager = TargetManager::new();
        let isa = Isa::parse("gfx908").unwrap();
        let a = manager.target_info(&isa).unwrap();
        let b = manager.target_info(&isa).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.subtarget.wavefront_size, 64);
    }

    #[test]
    fn unsupported_isa_is_a_target_error() {
        let manager = TargetManager::new();
        let isa = Isa::parse("gfx1100").unwrap();
        match manager.target_info(&isa) {
            Err(Error::Target { .. }) => {}
            other => panic!("expected target error, got {other:?}"),
        }
    }

    #[test]
    fn target_machines_are_fresh() {
        let manager = TargetManager::new();
        let isa = Isa::parse("gfx90a").unwrap();
        let tm = manager.create_target_machine(&isa).unwrap();
        assert_eq!(tm.options.code_object_version, 5);
    }
}
