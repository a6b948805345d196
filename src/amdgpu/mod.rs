//! The AMD GCN target layer: ISA naming, registers and operands, opcode
//! tables, the machine-code decoder/encoder pair, branch evaluation,
//! kernel descriptors, kernel metadata and the ELF view.
//!
//! Everything above this module (lifter, code generator, loader) treats
//! these as the backend's target description services.

pub mod branch;
pub mod decoder;
pub mod encoder;
pub mod inst;
pub mod isa;
pub mod kernel_descriptor;
pub mod metadata;
pub mod object;
pub mod opcodes;
pub mod operand;

pub use self::object::{AmdGcnObjectFile, RelocKind, RelocRecord};
pub use inst::{Inst, InstOperand};
pub use isa::Isa;
pub use kernel_descriptor::{KernelCodeProperties, KernelDescriptor, KERNEL_DESCRIPTOR_SIZE};
pub use metadata::{ArgValueKind, KernelArg, KernelMetadata};
pub use opcodes::{
    FlatOp, FlatSeg, Opcode, PseudoOp, SmemOp, Sop1Op, Sop2Op, SopcOp, SopkOp, SoppOp, Vop1Op,
    Vop2Op, Vop3Op,
};
pub use operand::{PhysReg, RegBank, SrcOperand};
