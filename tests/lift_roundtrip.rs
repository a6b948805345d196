//! Disassembly and lifting over a loaded code object: record sizes,
//! branch-target recovery, block structure, caching, and invalidation.

mod common;

use common::*;
use std::sync::Arc;
use wavetap::hsa::symbol::SymbolKindFilter;
use wavetap::Error;

fn branchy_kernel() -> CodeObjectSpec<'static> {
    // s_mov_b32 s0, 0x10 ; s_branch .L ; .L: s_endpgm
    CodeObjectSpec::new(
        "branchy",
        vec![s_mov_b32(0, 0x10), s_branch(0), s_endpgm()],
    )
}

#[test]
fn disassembly_round_trip_size() {
    let (runtime, core) = setup();
    let elf = build_code_object(&branchy_kernel());
    let (_exec, lco) = load_object(&runtime, &core, &elf);

    let kernel = core.cache().symbol_by_name(lco, "branchy").unwrap();
    let records = core.disassemble(&kernel).unwrap();
    assert_eq!(records.len(), 3);
    let total: u64 = records.iter().map(|r| r.size).sum();
    assert_eq!(total, kernel.size);
    for record in records.iter() {
        assert!(record.size > 0);
    }
    // addresses are contiguous
    for pair in records.windows(2) {
        assert_eq!(pair[0].address + pair[0].size, pair[1].address);
    }
}

#[test]
fn branch_target_is_an_instruction_boundary() {
    let (runtime, core) = setup();
    let elf = build_code_object(&branchy_kernel());
    let (_exec, lco) = load_object(&runtime, &core, &elf);

    let kernel = core.cache().symbol_by_name(lco, "branchy").unwrap();
    let records = core.disassemble(&kernel).unwrap();
    // the branch at record 1 targets record 2
    let expected = records[1].address + 4;
    assert_eq!(records[2].address, expected);
    let entry = core.cache().entry(lco).unwrap();
    assert!(entry.contains_address(expected));
}

#[test]
fn lift_recovers_two_blocks_with_an_edge() {
    let (runtime, core) = setup();
    let elf = build_code_object(&branchy_kernel());
    let (_exec, lco) = load_object(&runtime, &core, &elf);

    let kernel = core.cache().symbol_by_name(lco, "branchy").unwrap();
    let lr = core.lift(&kernel).unwrap();
    let mf = lr.kernel_mf();
    assert_eq!(mf.blocks.len(), 2);
    assert_eq!(mf.blocks[0].succs, vec![mf.blocks[1].id]);
    assert_eq!(mf.blocks[1].preds, vec![mf.blocks[0].id]);
    // block 0: mov + branch, block 1: endpgm
    assert_eq!(mf.blocks[0].insts.len(), 2);
    assert_eq!(mf.blocks[1].insts.len(), 1);
}

#[test]
fn every_lifted_instruction_has_a_record_preimage() {
    let (runtime, core) = setup();
    let elf = build_code_object(&branchy_kernel());
    let (_exec, lco) = load_object(&runtime, &core, &elf);

    let kernel = core.cache().symbol_by_name(lco, "branchy").unwrap();
    let lr = core.lift(&kernel).unwrap();
    for inst in lr.kernel_mf().insts() {
        let record = lr
            .record_for(inst.id)
            .expect("lifted instruction without a source record");
        assert_eq!(record.inst.opcode, inst.opcode);
    }
    // and the other direction
    for i in 0..lr.records().len() {
        assert!(lr.mi_for_record(i).is_some());
    }
}

#[test]
fn concurrent_lifts_share_the_cached_representation() {
    let (runtime, core) = setup();
    let elf = build_code_object(&branchy_kernel());
    let (_exec, lco) = load_object(&runtime, &core, &elf);
    let kernel = core.cache().symbol_by_name(lco, "branchy").unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let core = Arc::clone(&core);
        let kernel = Arc::clone(&kernel);
        handles.push(std::thread::spawn(move || core.lift(&kernel).unwrap()));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(Arc::ptr_eq(&results[0], &results[1]));
}

#[test]
fn clone_is_independent_of_the_cached_original() {
    let (runtime, core) = setup();
    let elf = build_code_object(&branchy_kernel());
    let (_exec, lco) = load_object(&runtime, &core, &elf);
    let kernel = core.cache().symbol_by_name(lco, "branchy").unwrap();

    let lr = core.lift(&kernel).unwrap();
    let before = lr.kernel_mf().inst_count();
    let mut clone = core.lifter().clone_representation(&lr).unwrap();
    // mutate the clone
    let kernel_name = clone.kernel.name.clone();
    let extra = clone
        .mir
        .new_inst(wavetap::amdgpu::Opcode::Sopp(wavetap::amdgpu::SoppOp::S_NOP))
        .with(wavetap::mir::MachOperand::Imm(0));
    let func = clone.mir.function_mut(&kernel_name).unwrap();
    func.blocks[0].insts.insert(0, extra);

    assert_eq!(lr.kernel_mf().inst_count(), before);
    assert_eq!(func.inst_count(), before + 1);
    // the clone keeps a usable record map until it is transformed
    let first = func.blocks[0].insts[1].id;
    assert!(clone.record_for(first).is_some());
}

#[test]
fn destroy_invalidates_cache_and_lift() {
    let (runtime, core) = setup();
    let elf = build_code_object(&branchy_kernel());
    let (exec, lco) = load_object(&runtime, &core, &elf);
    let kernel = core.cache().symbol_by_name(lco, "branchy").unwrap();

    // hold a reference across the destruction
    let lr = core.lift(&kernel).unwrap();
    assert!(core.cache().is_cached(lco));

    core.on_executable_destroyed(exec);

    assert!(!core.cache().is_cached(lco));
    // the held reference stays usable
    assert_eq!(lr.kernel_mf().blocks.len(), 2);
    // but a fresh lift reports the invalidation
    match core.lift(&kernel) {
        Err(Error::CacheMiss { .. }) => {}
        other => panic!("expected cache miss, got {other:?}"),
    }
    match core.cache().symbols(lco, SymbolKindFilter::Kernel) {
        Err(Error::CacheMiss { .. }) => {}
        other => panic!("expected cache miss, got {other:?}"),
    }
}

#[test]
fn decode_error_reports_loaded_offset() {
    let (runtime, core) = setup();
    // an unsupported encoding word in the middle of the kernel
    let mut spec = CodeObjectSpec::new("bad", vec![s_mov_b32(0, 1)]);
    spec.insts.push(s_endpgm());
    let mut elf = build_code_object(&spec);
    // corrupt the second instruction in place: find the code and stomp a
    // reserved format on it
    let needle = wavetap::amdgpu::encoder::encode(&s_endpgm()).unwrap();
    let pos = elf
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("endpgm bytes present");
    elf[pos..pos + 4].copy_from_slice(&0xfc00_0000u32.to_le_bytes());

    let (_exec, lco) = load_object(&runtime, &core, &elf);
    let kernel = core.cache().symbol_by_name(lco, "bad").unwrap();
    match core.disassemble(&kernel) {
        Err(Error::Decode { offset, .. }) => {
            assert_eq!(offset, kernel.address + 4);
        }
        other => panic!("expected decode error, got {other:?}"),
    }
}
