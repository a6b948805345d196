//! The 64-byte AMDHSA kernel descriptor.
//!
//! Every kernel symbol `<name>` in a code object is accompanied by an
//! OBJECT symbol `<name>.kd` pointing at this structure. The dispatch
//! packet's `kernel_object` field is the loaded address of the descriptor,
//! so redirecting a dispatch means swapping in another descriptor address.

use crate::error::{Error, Result};
use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Cursor, Seek, SeekFrom, Write};

pub const KERNEL_DESCRIPTOR_SIZE: usize = 64;

bitflags! {
    /// `kernel_code_properties`, the u16 at byte 56.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KernelCodeProperties: u16 {
        const ENABLE_SGPR_PRIVATE_SEGMENT_BUFFER = 1 << 0;
        const ENABLE_SGPR_DISPATCH_PTR = 1 << 1;
        const ENABLE_SGPR_QUEUE_PTR = 1 << 2;
        const ENABLE_SGPR_KERNARG_SEGMENT_PTR = 1 << 3;
        const ENABLE_SGPR_DISPATCH_ID = 1 << 4;
        const ENABLE_SGPR_FLAT_SCRATCH_INIT = 1 << 5;
        const ENABLE_SGPR_PRIVATE_SEGMENT_SIZE = 1 << 6;
        const ENABLE_WAVEFRONT_SIZE32 = 1 << 10;
        const USES_DYNAMIC_STACK = 1 << 11;
    }
}

fn field(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1 << width) - 1)
}

fn set_field(word: &mut u32, shift: u32, width: u32, value: u32) {
    let mask = ((1u32 << width) - 1) << shift;
    *word = (*word & !mask) | ((value << shift) & mask);
}

/// Parsed kernel descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub group_segment_fixed_size: u32,
    pub private_segment_fixed_size: u32,
    pub kernarg_size: u32,
    /// Byte offset from the descriptor to the kernel entry point; carried
    /// as a relocation in relocatable objects.
    pub kernel_code_entry_byte_offset: i64,
    pub compute_pgm_rsrc3: u32,
    pub compute_pgm_rsrc1: u32,
    pub compute_pgm_rsrc2: u32,
    pub kernel_code_properties: KernelCodeProperties,
    pub kernarg_preload: u16,
}

impl KernelDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < KERNEL_DESCRIPTOR_SIZE {
            return Err(Error::Object(format!(
                "kernel descriptor truncated: {} bytes",
                buf.len()
            )));
        }
        let mut crs = Cursor::new(buf);
        let read = |crs: &mut Cursor<&[u8]>| -> std::io::Result<KernelDescriptor> {
            let mut kd = KernelDescriptor {
                group_segment_fixed_size: crs.read_u32::<LE>()?,
                private_segment_fixed_size: crs.read_u32::<LE>()?,
                kernarg_size: crs.read_u32::<LE>()?,
                ..Default::default()
            };
            crs.seek(SeekFrom::Current(4))?; /* reserved */
            kd.kernel_code_entry_byte_offset = crs.read_i64::<LE>()?;
            crs.seek(SeekFrom::Current(20))?; /* reserved */
            kd.compute_pgm_rsrc3 = crs.read_u32::<LE>()?;
            kd.compute_pgm_rsrc1 = crs.read_u32::<LE>()?;
            kd.compute_pgm_rsrc2 = crs.read_u32::<LE>()?;
            kd.kernel_code_properties =
                KernelCodeProperties::from_bits_truncate(crs.read_u16::<LE>()?);
            kd.kernarg_preload = crs.read_u16::<LE>()?;
            Ok(kd)
        };
        read(&mut crs).map_err(|e| Error::Object(format!("kernel descriptor: {e}")))
    }

    pub fn to_bytes(&self) -> [u8; KERNEL_DESCRIPTOR_SIZE] {
        let mut buf = [0u8; KERNEL_DESCRIPTOR_SIZE];
        let mut crs = Cursor::new(&mut buf[..]);
        // the writes below cannot fail on a fixed-size buffer
        crs.write_u32::<LE>(self.group_segment_fixed_size).unwrap();
        crs.write_u32::<LE>(self.private_segment_fixed_size).unwrap();
        crs.write_u32::<LE>(self.kernarg_size).unwrap();
        crs.write_all(&[0; 4]).unwrap();
        crs.write_i64::<LE>(self.kernel_code_entry_byte_offset).unwrap();
        crs.write_all(&[0; 20]).unwrap();
        crs.write_u32::<LE>(self.compute_pgm_rsrc3).unwrap();
        crs.write_u32::<LE>(self.compute_pgm_rsrc1).unwrap();
        crs.write_u32::<LE>(self.compute_pgm_rsrc2).unwrap();
        crs.write_u16::<LE>(self.kernel_code_properties.bits()).unwrap();
        crs.write_u16::<LE>(self.kernarg_preload).unwrap();
        buf
    }

    /// Wavefront VGPR count, ungranulated (gfx9 granule of 4).
    pub fn vgpr_count(&self) -> u32 {
        (field(self.compute_pgm_rsrc1, 0, 6) + 1) * 4
    }

    /// Wavefront SGPR count, ungranulated (gfx9 granule of 8).
    pub fn sgpr_count(&self) -> u32 {
        (field(self.compute_pgm_rsrc1, 6, 4) + 1) * 8
    }

    pub fn set_vgpr_count(&mut self, vgprs: u32) {
        let granules = vgprs.max(1).div_ceil(4) - 1;
        set_field(&mut self.compute_pgm_rsrc1, 0, 6, granules);
    }

    pub fn set_sgpr_count(&mut self, sgprs: u32) {
        let granules = sgprs.max(1).div_ceil(8) - 1;
        set_field(&mut self.compute_pgm_rsrc1, 6, 4, granules);
    }

    pub fn user_sgpr_count(&self) -> u32 {
        field(self.compute_pgm_rsrc2, 1, 5)
    }

    pub fn set_user_sgpr_count(&mut self, count: u32) {
        set_field(&mut self.compute_pgm_rsrc2, 1, 5, count);
    }

    pub fn enable_sgpr_workgroup_id(&self) -> (bool, bool, bool) {
        (
            field(self.compute_pgm_rsrc2, 7, 1) != 0,
            field(self.compute_pgm_rsrc2, 8, 1) != 0,
            field(self.compute_pgm_rsrc2, 9, 1) != 0,
        )
    }

    /// Whether scratch (private segment) is wired up at dispatch.
    pub fn enables_private_segment(&self) -> bool {
        field(self.compute_pgm_rsrc2, 0, 1) != 0
    }

    pub fn set_enables_private_segment(&mut self, on: bool) {
        set_field(&mut self.compute_pgm_rsrc2, 0, 1, on as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let mut kd = KernelDescriptor {
            group_segment_fixed_size: 1024,
            private_segment_fixed_size: 64,
            kernarg_size: 32,
            kernel_code_entry_byte_offset: 256,
            ..Default::default()
        };
        kd.set_vgpr_count(12);
        kd.set_sgpr_count(24);
        kd.set_user_sgpr_count(6);
        kd.kernel_code_properties = KernelCodeProperties::ENABLE_SGPR_KERNARG_SEGMENT_PTR
            | KernelCodeProperties::ENABLE_SGPR_DISPATCH_ID;

        let bytes = kd.to_bytes();
        assert_eq!(bytes.len(), KERNEL_DESCRIPTOR_SIZE);
        let back = KernelDescriptor::parse(&bytes).unwrap();
        assert_eq!(back, kd);
    }

    #[test]
    fn register_granulation() {
        let mut kd = KernelDescriptor::default();
        kd.set_vgpr_count(9);
        assert_eq!(kd.vgpr_count(), 12); // rounded up to a granule of 4
        kd.set_sgpr_count(16);
        assert_eq!(kd.sgpr_count(), 16);
        kd.set_sgpr_count(17);
        assert_eq!(kd.sgpr_count(), 24);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        assert!(KernelDescriptor::parse(&[0u8; 32]).is_err());
    }
}
