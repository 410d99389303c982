use {
    common::*,
    minidump_builder::{FailSpotName, MinidumpBuilder, errors::BuilderError},
    std::path::Path,
};

mod common;

fn builder_with_inputs(dir: &Path, out: &Path) -> MinidumpBuilder {
    let kernel = two_section_image(MACHINE_I386, 0x40_0000).write_to(dir, "kernel.exe");
    let blob = write_blob(dir, "ram.bin", 0x40, 0x77);

    let mut builder = MinidumpBuilder::create(out).unwrap();
    builder.add_module(&kernel).unwrap();
    builder.add_blob(&blob, 0x1000).unwrap();
    builder
}

fn write_fails_and_cleans_up(spot: FailSpotName) {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("failing.dmp");
    let builder = builder_with_inputs(dir.path(), &out);

    let mut failspot_client = FailSpotName::testing_client();
    failspot_client.set_enabled(spot, true);
    let err = builder.write().unwrap_err();

    assert!(matches!(err, BuilderError::Output(_)), "{err:?}");
    assert!(!out.exists(), "{} left behind", out.display());
}

#[test]
fn thread_list_failure() {
    write_fails_and_cleans_up(FailSpotName::WriteThreadList);
}

#[test]
fn module_list_failure() {
    write_fails_and_cleans_up(FailSpotName::WriteModuleList);
}

#[test]
fn memory_list_failure() {
    write_fails_and_cleans_up(FailSpotName::WriteMemoryList);
}

#[test]
fn checksum_failure() {
    write_fails_and_cleans_up(FailSpotName::Checksum);
}

#[test]
fn disabled_spots_do_not_fail() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("fine.dmp");
    let builder = builder_with_inputs(dir.path(), &out);

    let _failspot_client = FailSpotName::testing_client();
    let summary = builder.write().unwrap();
    assert_eq!(summary.regions.len(), 1 + 3 + 1);
    assert!(out.exists());
}
