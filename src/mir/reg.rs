//! Registers as machine IR sees them: physical or virtual, with a class.

use crate::amdgpu::{PhysReg, RegBank};
use std::fmt;

/// Register classes the allocator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    SGpr32,
    SGpr64,
    SGpr128,
    VGpr32,
    VGpr64,
}

impl RegClass {
    pub fn bank(self) -> RegBank {
        match self {
            RegClass::SGpr32 | RegClass::SGpr64 | RegClass::SGpr128 => RegBank::Scalar,
            RegClass::VGpr32 | RegClass::VGpr64 => RegBank::Vector,
        }
    }

    pub fn dwords(self) -> u32 {
        match self {
            RegClass::SGpr32 | RegClass::VGpr32 => 1,
            RegClass::SGpr64 | RegClass::VGpr64 => 2,
            RegClass::SGpr128 => 4,
        }
    }

    /// The class a physical register naturally belongs to, one dword wide.
    pub fn of_phys(reg: PhysReg) -> RegClass {
        match reg.bank() {
            RegBank::Vector => RegClass::VGpr32,
            _ => RegClass::SGpr32,
        }
    }
}

/// A virtual register, scoped to one machine function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtReg(pub u32);

impl fmt::Display for VirtReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Either a physical register or a virtual one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Phys(PhysReg),
    Virt(VirtReg),
}

impl Register {
    pub fn as_phys(self) -> Option<PhysReg> {
        match self {
            Register::Phys(r) => Some(r),
            Register::Virt(_) => None,
        }
    }

    pub fn as_virt(self) -> Option<VirtReg> {
        match self {
            Register::Virt(v) => Some(v),
            Register::Phys(_) => None,
        }
    }

    pub fn is_virt(self) -> bool {
        matches!(self, Register::Virt(_))
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Phys(r) => write!(f, "{r}"),
            Register::Virt(v) => write!(f, "{v}"),
        }
    }
}

impl From<PhysReg> for Register {
    fn from(r: PhysReg) -> Self {
        Register::Phys(r)
    }
}

impl From<VirtReg> for Register {
    fn from(v: VirtReg) -> Self {
        Register::Virt(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_properties() {
        assert_eq!(RegClass::SGpr64.dwords(), 2);
        assert_eq!(RegClass::VGpr32.bank(), RegBank::Vector);
        assert_eq!(RegClass::of_phys(PhysReg::Vgpr(3)), RegClass::VGpr32);
        assert_eq!(RegClass::of_phys(PhysReg::Sgpr(0)), RegClass::SGpr32);
        assert_eq!(RegClass::of_phys(PhysReg::M0), RegClass::SGpr32);
    }

    #[test]
    fn register_casts() {
        let r = Register::from(PhysReg::Sgpr(4));
        assert_eq!(r.as_phys(), Some(PhysReg::Sgpr(4)));
        assert_eq!(r.as_virt(), None);
        let v = Register::from(VirtReg(7));
        assert!(v.is_virt());
        assert_eq!(v.to_string(), "%7");
    }
}
