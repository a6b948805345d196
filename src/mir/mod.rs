//! The machine IR: one step above machine code.
//!
//! Opcodes and registers are concrete target entities, but operands may
//! still reference globals and basic blocks symbolically, virtual
//! registers exist, and instruction lists are freely editable. Lifting
//! produces this IR from instruction records; the code generator mutates
//! it and prints it back to machine code.

pub mod function;
pub mod inst;
pub mod module;
pub mod reg;

pub use function::{FrameInfo, MachBasicBlock, MachFunction};
pub use inst::{GlobalRef, InstId, MachInst, MachOperand, MbbId, RegOperand};
pub use module::{MirGlobal, MirModule};
pub use reg::{RegClass, Register, VirtReg};
