//! Shared fixtures: build small AMD GCN code objects with `object::write`
//! and run them through a core wired to the mock runtime.

#![allow(dead_code)]

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, FileFlags, SymbolFlags, SymbolKind, SymbolScope,
};
use std::sync::Arc;
use wavetap::amdgpu::object::{EM_AMDGPU, METADATA_SECTION};
use wavetap::amdgpu::{
    encoder, metadata, Inst, InstOperand, Isa, KernelCodeProperties, KernelDescriptor,
};
use wavetap::amdgpu::{KernelArg, KernelMetadata, Opcode, PhysReg, Sop2Op, SoppOp};
use wavetap::hsa::testing::MockRuntime;
use wavetap::hsa::{Agent, ExecutableHandle, HsaRuntime, LcoHandle};
use wavetap::InstrumentationCore;

pub const AGENT: Agent = Agent(1);

pub fn test_isa() -> Isa {
    Isa::parse("gfx908").unwrap()
}

/// A kernel descriptor suitable for the tests: kernarg pointer in
/// s[0:1], workgroup id x enabled.
pub fn test_descriptor(kernarg_size: u32) -> KernelDescriptor {
    let mut kd = KernelDescriptor {
        kernarg_size,
        ..Default::default()
    };
    kd.kernel_code_properties = KernelCodeProperties::ENABLE_SGPR_KERNARG_SEGMENT_PTR;
    kd.set_user_sgpr_count(2);
    kd.compute_pgm_rsrc2 |= 1 << 7; // workgroup id x
    kd.set_sgpr_count(16);
    kd.set_vgpr_count(4);
    kd
}

pub struct CodeObjectSpec<'a> {
    pub kernel: &'a str,
    pub insts: Vec<Inst>,
    pub descriptor: KernelDescriptor,
    /// (name, initialiser bytes) pairs placed in `.data`.
    pub globals: Vec<(String, Vec<u8>)>,
    /// Extra sections, e.g. the tool payload.
    pub sections: Vec<(String, Vec<u8>)>,
}

impl<'a> CodeObjectSpec<'a> {
    pub fn new(kernel: &'a str, insts: Vec<Inst>) -> Self {
        CodeObjectSpec {
            kernel,
            insts,
            descriptor: test_descriptor(8),
            globals: Vec::new(),
            sections: Vec::new(),
        }
    }
}

/// Builds a loadable AMD GCN code object.
pub fn build_code_object(spec: &CodeObjectSpec<'_>) -> Vec<u8> {
    // written under a stand-in architecture; e_machine is stamped below
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    obj.flags = FileFlags::Elf {
        os_abi: 64,
        abi_version: 2,
        e_flags: test_isa().to_elf_flags().unwrap(),
    };

    let text = obj.section_id(StandardSection::Text);
    let code = encoder::encode_all(spec.insts.iter()).expect("encodable test kernel");
    obj.append_section_data(text, &code, 256);
    obj.add_symbol(Symbol {
        name: spec.kernel.as_bytes().to_vec(),
        value: 0,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let rodata = obj.section_id(StandardSection::ReadOnlyData);
    let kd_off = obj.append_section_data(rodata, &spec.descriptor.to_bytes(), 64);
    obj.add_symbol(Symbol {
        name: format!("{}.kd", spec.kernel).into_bytes(),
        value: kd_off,
        size: 64,
        kind: SymbolKind::Data,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(rodata),
        flags: SymbolFlags::None,
    });

    if !spec.globals.is_empty() {
        let data = obj.section_id(StandardSection::Data);
        for (name, bytes) in &spec.globals {
            let off = obj.append_section_data(data, bytes, 8);
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: off,
                size: bytes.len() as u64,
                kind: SymbolKind::Data,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Section(data),
                flags: SymbolFlags::None,
            });
        }
    }

    let doc = metadata::write_metadata(&[KernelMetadata {
        name: spec.kernel.to_string(),
        symbol: format!("{}.kd", spec.kernel),
        kernarg_segment_size: spec.descriptor.kernarg_size,
        private_segment_fixed_size: spec.descriptor.private_segment_fixed_size,
        group_segment_fixed_size: spec.descriptor.group_segment_fixed_size,
        sgpr_count: spec.descriptor.sgpr_count(),
        vgpr_count: spec.descriptor.vgpr_count(),
        wavefront_size: 64,
        args: vec![KernelArg {
            name: Some("out".into()),
            size: 8,
            offset: 0,
            value_kind: wavetap::amdgpu::ArgValueKind::GlobalBuffer,
        }],
    }]);
    let md = obj.add_section(
        Vec::new(),
        METADATA_SECTION.as_bytes().to_vec(),
        object::SectionKind::Other,
    );
    obj.append_section_data(md, doc.as_bytes(), 1);

    for (name, bytes) in &spec.sections {
        let id = obj.add_section(
            Vec::new(),
            name.as_bytes().to_vec(),
            object::SectionKind::Other,
        );
        obj.append_section_data(id, bytes, 1);
    }

    let mut bytes = obj.write().expect("writable test object");
    bytes[18..20].copy_from_slice(&EM_AMDGPU.to_le_bytes());
    bytes
}

/// A core over a fresh mock runtime.
pub fn setup() -> (Arc<MockRuntime>, Arc<InstrumentationCore>) {
    let runtime = MockRuntime::new();
    let core = InstrumentationCore::new(Arc::clone(&runtime) as Arc<dyn HsaRuntime>);
    (runtime, core)
}

/// Loads a code object the way the runtime callbacks would.
pub fn load_object(
    runtime: &Arc<MockRuntime>,
    core: &InstrumentationCore,
    elf: &[u8],
) -> (ExecutableHandle, LcoHandle) {
    let exec = runtime.create_executable(AGENT).unwrap();
    let info = runtime.load_code_object(exec, AGENT, elf).unwrap();
    core.on_code_object_loaded(exec, AGENT, info, elf).unwrap();
    runtime.freeze_executable(exec).unwrap();
    core.on_executable_frozen(exec).unwrap();
    (exec, info.handle)
}

// instruction shorthands

pub fn s_mov_b32(dst: u16, imm: i64) -> Inst {
    Inst::with_operands(
        Opcode::Sop1(wavetap::amdgpu::Sop1Op::S_MOV_B32),
        [InstOperand::Reg(PhysReg::Sgpr(dst)), InstOperand::Imm(imm)],
    )
}

pub fn s_add_u32(dst: u16, src: u16, imm: i64) -> Inst {
    Inst::with_operands(
        Opcode::Sop2(Sop2Op::S_ADD_U32),
        [
            InstOperand::Reg(PhysReg::Sgpr(dst)),
            InstOperand::Reg(PhysReg::Sgpr(src)),
            InstOperand::Imm(imm),
        ],
    )
}

pub fn s_branch(simm: i64) -> Inst {
    Inst::with_operands(Opcode::Sopp(SoppOp::S_BRANCH), [InstOperand::Imm(simm)])
}

pub fn s_endpgm() -> Inst {
    Inst::with_operands(Opcode::Sopp(SoppOp::S_ENDPGM), [InstOperand::Imm(0)])
}
