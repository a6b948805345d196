//! AQL packets.
//!
//! The only packet the core rewrites is the kernel dispatch packet;
//! vendor-specific and barrier packets are recognised so callers can route
//! around them.

/// Packet type, bits [7:0] of the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    VendorSpecific,
    Invalid,
    KernelDispatch,
    BarrierAnd,
    AgentDispatch,
    BarrierOr,
    Unknown(u8),
}

impl PacketType {
    pub fn from_header(header: u16) -> Self {
        match (header & 0xff) as u8 {
            0 => PacketType::VendorSpecific,
            1 => PacketType::Invalid,
            2 => PacketType::KernelDispatch,
            3 => PacketType::BarrierAnd,
            4 => PacketType::AgentDispatch,
            5 => PacketType::BarrierOr,
            other => PacketType::Unknown(other),
        }
    }
}

/// The 64-byte AQL kernel dispatch packet.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    /// Loaded address of the kernel descriptor to launch.
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: u64,
}

impl KernelDispatchPacket {
    pub fn packet_type(&self) -> PacketType {
        PacketType::from_header(self.header)
    }

    pub fn is_kernel_dispatch(&self) -> bool {
        self.packet_type() == PacketType::KernelDispatch
    }
}

impl Default for KernelDispatchPacket {
    fn default() -> Self {
        KernelDispatchPacket {
            header: 2, // kernel dispatch
            setup: 1,  // one grid dimension
            workgroup_size_x: 64,
            workgroup_size_y: 1,
            workgroup_size_z: 1,
            reserved0: 0,
            grid_size_x: 64,
            grid_size_y: 1,
            grid_size_z: 1,
            private_segment_size: 0,
            group_segment_size: 0,
            kernel_object: 0,
            kernarg_address: 0,
            reserved2: 0,
            completion_signal: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_layout_is_one_aql_slot() {
        assert_eq!(std::mem::size_of::<KernelDispatchPacket>(), 64);
    }

    #[test]
    fn header_type_decoding() {
        let mut packet = KernelDispatchPacket::default();
        assert!(packet.is_kernel_dispatch());
        packet.header = 3;
        assert_eq!(packet.packet_type(), PacketType::BarrierAnd);
        packet.header = 0x0207; // type in the low byte only
        assert_eq!(packet.packet_type(), PacketType::Unknown(7));
    }
}
