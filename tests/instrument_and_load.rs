//! End-to-end instrumentation: register a tool payload, splice a hook
//! before an instruction, load the instrumented kernel under a preset,
//! and redirect a dispatch packet.

mod common;

use common::*;
use std::sync::Arc;
use wavetap::amdgpu::{AmdGcnObjectFile, PhysReg};
use wavetap::hsa::testing::MockRuntime;
use wavetap::hsa::HsaRuntime;
use wavetap::im::{HOOK_HANDLE_PREFIX, HOOK_IR_SECTION, RESERVED_MANAGED_VAR};
use wavetap::{HookArg, HookHandle, InstrumentationCore, KernelDispatchPacket};

const HOOK_PAYLOAD: &str = r#"
global @counter : i64
hook @count_adds(%n: i32) {
entry:
    %addr = addrof @counter
    %old = call.i32 @sAtomicAdd(%addr, %n)
    ret
}
"#;

const HOOK_SHADOW: usize = 0xbeef_0000;

fn app_kernel() -> CodeObjectSpec<'static> {
    CodeObjectSpec::new("vector_inc", vec![s_add_u32(0, 0, 1), s_endpgm()])
}

fn tool_object() -> CodeObjectSpec<'static> {
    let mut spec = CodeObjectSpec::new("__payload_marker", vec![s_endpgm()]);
    spec.globals = vec![
        (RESERVED_MANAGED_VAR.to_string(), vec![0xab; 8]),
        ("counter".to_string(), vec![0u8; 8]),
    ];
    spec.sections = vec![(HOOK_IR_SECTION.to_string(), HOOK_PAYLOAD.as_bytes().to_vec())];
    spec
}

struct Fixture {
    runtime: Arc<MockRuntime>,
    core: Arc<InstrumentationCore>,
    app_exec: wavetap::ExecutableHandle,
    app_lco: wavetap::LcoHandle,
    tool_exec: wavetap::ExecutableHandle,
}

fn fixture() -> Fixture {
    let (runtime, core) = setup();
    let (app_exec, app_lco) = load_object(&runtime, &core, &build_code_object(&app_kernel()));
    core.on_register_function(
        HOOK_SHADOW,
        &format!("{HOOK_HANDLE_PREFIX}count_adds"),
    );
    let (tool_exec, _tool_lco) = load_object(&runtime, &core, &build_code_object(&tool_object()));
    assert!(core.instrumentation_module().is_registered());
    Fixture {
        runtime,
        core,
        app_exec,
        app_lco,
        tool_exec,
    }
}

fn instrument(fx: &Fixture, preset: &str) -> Arc<wavetap::Symbol> {
    let kernel = fx.core.cache().symbol_by_name(fx.app_lco, "vector_inc").unwrap();
    let lr = fx.core.lift(&kernel).unwrap();
    let target = lr.mi_for_record(0).unwrap();
    fx.core
        .instrument_and_load(
            &kernel,
            &lr,
            |task, _lr| {
                task.insert_hook_before(target, HookHandle(HOOK_SHADOW), vec![HookArg::Imm(42)])
            },
            preset,
        )
        .unwrap();
    kernel
}

#[test]
fn instrument_and_load_registers_the_preset() {
    let fx = fixture();
    let kernel = fx.core.cache().symbol_by_name(fx.app_lco, "vector_inc").unwrap();
    assert!(!fx.core.is_kernel_instrumented(&kernel, "p"));

    let kernel = instrument(&fx, "p");
    assert!(fx.core.is_kernel_instrumented(&kernel, "p"));
    assert!(!fx.core.is_kernel_instrumented(&kernel, "other"));

    let info = fx
        .core
        .loader()
        .get_instrumented_kernel(&kernel, "p")
        .unwrap();
    assert_eq!(info.symbol.name, "vector_inc");
    assert_ne!(
        info.descriptor_address,
        kernel.as_kernel().unwrap().descriptor_address
    );
    // the instrumented code grew past the original two instructions
    assert!(info.symbol.size > kernel.size);
}

#[test]
fn repeated_loads_are_idempotent() {
    let fx = fixture();
    let kernel = instrument(&fx, "p");
    let first = fx
        .core
        .loader()
        .get_instrumented_kernel(&kernel, "p")
        .unwrap();

    // a second instrumentation under the same preset observes the first
    let lr = fx.core.lift(&kernel).unwrap();
    let target = lr.mi_for_record(0).unwrap();
    fx.core
        .instrument_and_load(
            &kernel,
            &lr,
            |task, _lr| {
                task.insert_hook_before(target, HookHandle(HOOK_SHADOW), vec![HookArg::Imm(1)])
            },
            "p",
        )
        .unwrap();
    let second = fx
        .core
        .loader()
        .get_instrumented_kernel(&kernel, "p")
        .unwrap();
    assert_eq!(first.descriptor_address, second.descriptor_address);
    assert_eq!(first.exec, second.exec);
}

#[test]
fn dispatch_packet_rewrite_is_idempotent() {
    let fx = fixture();
    let kernel = instrument(&fx, "p");
    let original_kd = kernel.as_kernel().unwrap().descriptor_address;
    let info = fx
        .core
        .loader()
        .get_instrumented_kernel(&kernel, "p")
        .unwrap();

    let mut packet = KernelDispatchPacket {
        kernel_object: original_kd,
        private_segment_size: 16,
        ..Default::default()
    };
    fx.core.override_with_instrumented(&mut packet, "p").unwrap();
    assert_eq!(packet.kernel_object, info.descriptor_address);
    // scratch widened monotonically
    assert!(packet.private_segment_size >= 16);

    let snapshot = packet;
    fx.core.override_with_instrumented(&mut packet, "p").unwrap();
    assert_eq!(packet, snapshot);
}

#[test]
fn instrumented_code_loads_with_resolved_counter() {
    let fx = fixture();
    let kernel = instrument(&fx, "p");
    let info = fx
        .core
        .loader()
        .get_instrumented_kernel(&kernel, "p")
        .unwrap();

    // the loaded instrumented kernel disassembles: the hook call
    // sequence and payload are in place
    let bytes = fx
        .runtime
        .read_device_memory(AGENT, info.symbol.address, info.symbol.size)
        .unwrap();
    let decoded = wavetap::amdgpu::decoder::decode_all(&bytes).unwrap();
    assert!(decoded.len() > 2, "only {} instructions", decoded.len());
    // the get-pc call sequence appears
    assert!(decoded.iter().any(|(inst, _)| {
        inst.opcode == wavetap::amdgpu::Opcode::Sop1(wavetap::amdgpu::Sop1Op::S_SWAPPC_B64)
    }));
}

#[test]
fn destroying_the_instrumented_executable_clears_the_preset() {
    let fx = fixture();
    let kernel = instrument(&fx, "p");
    let info = fx
        .core
        .loader()
        .get_instrumented_kernel(&kernel, "p")
        .unwrap();

    fx.core.on_executable_destroyed(info.exec);
    assert!(!fx.core.is_kernel_instrumented(&kernel, "p"));
}

#[test]
fn destroying_the_original_tears_down_instrumented_executables() {
    let fx = fixture();
    let kernel = instrument(&fx, "p");
    assert!(fx.core.is_kernel_instrumented(&kernel, "p"));

    fx.core.on_executable_destroyed(fx.app_exec);
    assert!(!fx.core.is_kernel_instrumented(&kernel, "p"));
}

#[test]
fn destroying_the_tool_executable_tears_down_the_module() {
    let fx = fixture();
    fx.core.on_executable_destroyed(fx.tool_exec);
    assert!(!fx.core.instrumentation_module().is_registered());
}

#[test]
fn unknown_hook_handle_is_rejected() {
    let fx = fixture();
    let kernel = fx.core.cache().symbol_by_name(fx.app_lco, "vector_inc").unwrap();
    let lr = fx.core.lift(&kernel).unwrap();
    let target = lr.mi_for_record(0).unwrap();
    let err = fx
        .core
        .instrument(&lr, |task, _lr| {
            task.insert_hook_before(target, HookHandle(0xdead), vec![])
        })
        .unwrap_err();
    assert!(err.to_string().contains("hook handle"));
}

#[test]
fn mutator_errors_propagate_verbatim() {
    let fx = fixture();
    let kernel = fx.core.cache().symbol_by_name(fx.app_lco, "vector_inc").unwrap();
    let lr = fx.core.lift(&kernel).unwrap();
    let err = fx
        .core
        .instrument(&lr, |_task, _lr| {
            Err(wavetap::Error::codegen("tool says no"))
        })
        .unwrap_err();
    assert!(err.to_string().contains("tool says no"));
}

#[test]
fn custom_intrinsic_lowers_to_a_scalar_copy() {
    use wavetap::intrinsics::{IntrinsicProcessor, IrLoweringInfo};
    use wavetap::mir::RegClass;

    let fx = fixture();
    // my.readReg32: IR constraint "s", MIR processor emits one COPY from
    // a physical register into the destination
    fx.core.code_generator().intrinsics().register(
        "my.readReg32",
        IntrinsicProcessor {
            ir_processor: Arc::new(|_func, _call, _tm| {
                let mut info = IrLoweringInfo::new();
                info.ret_constraint = Some("s".into());
                info.request_phys_reg(PhysReg::Sgpr(4));
                Ok(info)
            }),
            mir_processor: Arc::new(|_info, regs, builder| {
                let dst = regs
                    .iter()
                    .find(|(flag, _)| *flag == wavetap::intrinsics::AsmFlag::Def)
                    .map(|(_, reg)| *reg)
                    .unwrap();
                // the destination came out of selection as a scalar vreg
                if let wavetap::mir::Register::Virt(v) = dst {
                    assert_eq!(builder.func.vreg_class(v), RegClass::SGpr32);
                }
                let src = builder.phys_reg_vreg(PhysReg::Sgpr(4));
                let copy = builder.emit(wavetap::amdgpu::Opcode::Pseudo(
                    wavetap::amdgpu::PseudoOp::Copy,
                ));
                copy.operands
                    .push(wavetap::mir::MachOperand::reg_def(dst));
                copy.operands
                    .push(wavetap::mir::MachOperand::reg_use(src));
                Ok(())
            }),
        },
    );

    // a payload whose hook reads s4 through the custom intrinsic
    let payload = r#"
global @counter : i64
hook @probe() {
entry:
    %v = call.i32 @my.readReg32()
    %addr = addrof @counter
    %old = call.i32 @sAtomicAdd(%addr, %v)
    ret
}
"#;
    let mut tool = CodeObjectSpec::new("__payload_marker2", vec![s_endpgm()]);
    tool.globals = vec![
        (RESERVED_MANAGED_VAR.to_string(), vec![0xab; 8]),
        ("counter".to_string(), vec![0u8; 8]),
    ];
    tool.sections = vec![(HOOK_IR_SECTION.to_string(), payload.as_bytes().to_vec())];
    // replace the payload registered by the fixture
    load_object(&fx.runtime, &fx.core, &build_code_object(&tool));
    fx.core
        .on_register_function(0xfeed, &format!("{HOOK_HANDLE_PREFIX}probe"));

    let kernel = fx.core.cache().symbol_by_name(fx.app_lco, "vector_inc").unwrap();
    let lr = fx.core.lift(&kernel).unwrap();
    let target = lr.mi_for_record(0).unwrap();
    let instrumented = fx
        .core
        .instrument(&lr, |task, _lr| {
            task.insert_hook_before(target, HookHandle(0xfeed), vec![])
        })
        .unwrap();
    // the payload wrapper exists and carries machine code
    let wrapper = instrumented
        .mir
        .functions
        .iter()
        .find(|f| f.name.starts_with("__wavetap_injected_"))
        .expect("payload function present");
    assert!(wrapper.inst_count() > 0);
    let elf = fx
        .core
        .print_lifted_representation(&instrumented, wavetap::FileType::Relocatable)
        .unwrap();
    AmdGcnObjectFile::parse(&elf).unwrap();
}
