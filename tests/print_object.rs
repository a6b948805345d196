//! Printing a lifted representation back to a relocatable object, and
//! reloading what was printed.

mod common;

use common::*;
use wavetap::amdgpu::AmdGcnObjectFile;
use wavetap::FileType;

fn app() -> CodeObjectSpec<'static> {
    CodeObjectSpec::new(
        "roundtrip",
        vec![s_mov_b32(0, 5), s_add_u32(0, 0, 1), s_branch(0), s_endpgm()],
    )
}

#[test]
fn printed_object_parses_and_carries_the_kernel() {
    let (runtime, core) = setup();
    let (_exec, lco) = load_object(&runtime, &core, &build_code_object(&app()));
    let kernel = core.cache().symbol_by_name(lco, "roundtrip").unwrap();
    let lr = core.lift(&kernel).unwrap();

    let elf = core
        .print_lifted_representation(&lr, FileType::Relocatable)
        .unwrap();
    let obj = AmdGcnObjectFile::parse(&elf).unwrap();
    assert_eq!(obj.isa().unwrap(), test_isa());

    let symbols = obj.symbols();
    assert!(symbols.iter().any(|s| s.name == "roundtrip"));
    assert!(symbols.iter().any(|s| s.name == "roundtrip.kd"));
    let metadata = obj.kernel_metadata().unwrap();
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata[0].name, "roundtrip");
}

#[test]
fn printed_code_reloads_and_relifts_identically() {
    let (runtime, core) = setup();
    let (_exec, lco) = load_object(&runtime, &core, &build_code_object(&app()));
    let kernel = core.cache().symbol_by_name(lco, "roundtrip").unwrap();
    let lr = core.lift(&kernel).unwrap();
    let original_count = lr.kernel_mf().inst_count();

    let elf = core
        .print_lifted_representation(&lr, FileType::Relocatable)
        .unwrap();
    let (_exec2, lco2) = load_object(&runtime, &core, &elf);
    let kernel2 = core.cache().symbol_by_name(lco2, "roundtrip").unwrap();
    let lr2 = core.lift(&kernel2).unwrap();

    assert_eq!(lr2.kernel_mf().inst_count(), original_count);
    assert_eq!(lr2.kernel_mf().blocks.len(), lr.kernel_mf().blocks.len());
}

#[test]
fn assembly_listing_names_every_instruction() {
    let (runtime, core) = setup();
    let (_exec, lco) = load_object(&runtime, &core, &build_code_object(&app()));
    let kernel = core.cache().symbol_by_name(lco, "roundtrip").unwrap();
    let lr = core.lift(&kernel).unwrap();

    let listing = core
        .print_lifted_representation(&lr, FileType::Assembly)
        .unwrap();
    let text = String::from_utf8(listing).unwrap();
    assert!(text.contains("roundtrip:"));
    assert!(text.contains("s_add_u32"));
    assert!(text.contains("s_branch"));
    assert!(text.contains("s_endpgm"));
}
