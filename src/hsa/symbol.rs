//! Typed symbols over the ELF symbol tables of a loaded code object.
//!
//! The variant set is closed: kernels, device functions, variables and
//! externals. The shared part lives in [`Symbol`]; variant-specific data
//! sits in the [`SymbolKind`] arm. Dyn-cast style accessors (`as_kernel`
//! and friends) replace a deep class hierarchy.

use super::{LcoHandle, SymbolHandle};
use crate::amdgpu::{KernelDescriptor, KernelMetadata};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBinding {
    Global,
    Local,
}

/// Kernel-specific payload: the descriptor symbol and parsed metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInfo {
    /// Name of the `<kernel>.kd` descriptor symbol.
    pub descriptor_symbol: String,
    /// Loaded device address of the descriptor. This is the value a
    /// dispatch packet's `kernel_object` carries.
    pub descriptor_address: u64,
    pub descriptor: KernelDescriptor,
    pub metadata: KernelMetadata,
}

/// Variant payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolKind {
    Kernel(Box<KernelInfo>),
    DeviceFunction,
    Variable,
    /// Unresolved in this LCO; resolved against another LCO of the same
    /// agent on access.
    External,
}

/// Filter for symbol enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKindFilter {
    Kernel,
    DeviceFunction,
    Variable,
    External,
}

/// A typed handle over one ELF symbol of a loaded code object.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    /// The backing loaded code object.
    pub lco: LcoHandle,
    pub name: String,
    /// Loaded device address (file address plus load delta).
    pub address: u64,
    /// Virtual address inside the ELF image.
    pub file_address: u64,
    pub size: u64,
    pub binding: SymbolBinding,
    /// Runtime-visible handle; present only for global symbols.
    pub runtime_handle: Option<SymbolHandle>,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn matches(&self, filter: SymbolKindFilter) -> bool {
        matches!(
            (&self.kind, filter),
            (SymbolKind::Kernel(_), SymbolKindFilter::Kernel)
                | (SymbolKind::DeviceFunction, SymbolKindFilter::DeviceFunction)
                | (SymbolKind::Variable, SymbolKindFilter::Variable)
                | (SymbolKind::External, SymbolKindFilter::External)
        )
    }

    /// Kernels and device functions carry machine code.
    pub fn is_function(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::Kernel(_) | SymbolKind::DeviceFunction
        )
    }

    pub fn as_kernel(&self) -> Option<&KernelInfo> {
        match &self.kind {
            SymbolKind::Kernel(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.kind, SymbolKind::External)
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, SymbolKind::Variable)
    }

    /// Whether `addr` falls inside the symbol's loaded range.
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address + self.size.max(1)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SymbolKind::Kernel(_) => "kernel",
            SymbolKind::DeviceFunction => "device function",
            SymbolKind::Variable => "variable",
            SymbolKind::External => "external",
        };
        write!(f, "{} `{}` @ {:#x}", kind, self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable(name: &str, address: u64, size: u64) -> Symbol {
        Symbol {
            lco: LcoHandle(1),
            name: name.into(),
            address,
            file_address: address,
            size,
            binding: SymbolBinding::Global,
            runtime_handle: None,
            kind: SymbolKind::Variable,
        }
    }

    #[test]
    fn filters() {
        let sym = variable("counter", 0x1000, 8);
        assert!(sym.matches(SymbolKindFilter::Variable));
        assert!(!sym.matches(SymbolKindFilter::Kernel));
        assert!(!sym.is_function());
        assert!(sym.as_kernel().is_none());
    }

    #[test]
    fn address_containment() {
        let sym = variable("counter", 0x1000, 8);
        assert!(sym.contains_address(0x1000));
        assert!(sym.contains_address(0x1007));
        assert!(!sym.contains_address(0x1008));
        // zero-sized symbols still own their first byte
        let empty = variable("marker", 0x2000, 0);
        assert!(empty.contains_address(0x2000));
    }
}
