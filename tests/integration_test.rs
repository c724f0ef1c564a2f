//! Integration tests that drive the public API over synthetic PE images.
//!
//! The images model a small MSVC x64 module:
//! - `.text` at RVA 0x1000 holding the methods of `Foo` and `Bar`
//! - `.rdata` at RVA 0x2000 holding locators, hierarchy descriptors and vtables
//! - `.data` at RVA 0x4000 holding the `type_info` objects
//!
//! `Bar` derives from `Foo` and a second base, so it gets a primary vtable
//! (`offset == 0`) and a secondary one (`offset == 16`).

use vmtsig::pe::{
    CODE_SECTION_CHARACTERISTICS, DATA_SECTION_CHARACTERISTICS, RDATA_SECTION_CHARACTERISTICS,
};
use vmtsig::{
    apply_steps, find_vmt, find_vmts, scan_section, Pattern, PeBuilder, PeImage, SignatureDocument,
    Step, Verifier, VerifyConfig,
};

const IMAGE_BASE: u64 = 0x1_8000_0000;

const TEXT_RVA: u32 = 0x1000;
const RDATA_RVA: u32 = 0x2000;
const DATA_RVA: u32 = 0x4000;

// type_info objects in .data
const TD_FOO: u32 = DATA_RVA;
const TD_BAR: u32 = DATA_RVA + 0x40;

// Hierarchy descriptors in .rdata, each followed by its base class array and
// first base class descriptor
const CHD_FOO: u32 = RDATA_RVA + 0x100;
const CHD_BAR: u32 = RDATA_RVA + 0x200;

// Complete object locators in .rdata
const COL_FOO: u32 = RDATA_RVA + 0x80;
const COL_BAR: u32 = RDATA_RVA + 0xA0;
const COL_BAR_SECONDARY: u32 = RDATA_RVA + 0xC0;

// Meta slots (pointer to the locator); the vtable starts 8 bytes later
const META_FOO: u32 = RDATA_RVA + 0x400;
const META_BAR: u32 = RDATA_RVA + 0x500;
const META_BAR_SECONDARY: u32 = RDATA_RVA + 0x600;

// Functions in .text
const FOO_METHODS: [u32; 4] = [TEXT_RVA, TEXT_RVA + 0x20, TEXT_RVA + 0x40, TEXT_RVA + 0x60];
const BAR_METHODS: [u32; 2] = [TEXT_RVA + 0x80, TEXT_RVA + 0x40];
const BAR_SECONDARY_METHODS: [u32; 1] = [TEXT_RVA + 0xA0];

/// `push rbp; mov ebp, esp` followed by two filler bytes.
const PROLOGUE: [u8; 5] = [0x55, 0x8B, 0xEC, 0x51, 0x52];

fn write_type_descriptor(b: &mut PeBuilder, rva: u32, name: &[u8]) {
    // vfptr to type_info's vtable; any non-null value
    b.write_va(rva, RDATA_RVA + 0xF00).unwrap();
    b.write(rva + 16, name).unwrap();
}

fn write_hierarchy(b: &mut PeBuilder, chd: u32, td: u32, num_bases: u32) {
    b.write_u32(chd, 0).unwrap();
    b.write_u32(chd + 4, 0).unwrap();
    b.write_u32(chd + 8, num_bases).unwrap();
    b.write_u32(chd + 12, chd + 0x10).unwrap();
    b.write_u32(chd + 0x10, chd + 0x20).unwrap();
    b.write_u32(chd + 0x20, td).unwrap();
}

fn write_locator(b: &mut PeBuilder, col: u32, offset: u32, td: u32, chd: u32) {
    b.write_u32(col, 1).unwrap();
    b.write_u32(col + 4, offset).unwrap();
    b.write_u32(col + 12, td).unwrap();
    b.write_u32(col + 16, chd).unwrap();
    b.write_u32(col + 20, col).unwrap();
}

fn write_vtable(b: &mut PeBuilder, meta: u32, col: u32, methods: &[u32]) {
    b.write_va(meta, col).unwrap();
    for (i, &method) in methods.iter().enumerate() {
        b.write_va(meta + 8 + 8 * i as u32, method).unwrap();
    }
}

fn build_module() -> Vec<u8> {
    let mut b = PeBuilder::new(IMAGE_BASE);
    assert_eq!(b.add_section(".text", CODE_SECTION_CHARACTERISTICS, 0x200), TEXT_RVA);
    assert_eq!(b.add_section(".rdata", RDATA_SECTION_CHARACTERISTICS, 0x2000), RDATA_RVA);
    assert_eq!(b.add_section(".data", DATA_SECTION_CHARACTERISTICS, 0x200), DATA_RVA);

    // Foo's slot 2 is the prologue; Bar's slot 1 shares it
    b.write(FOO_METHODS[2], &PROLOGUE).unwrap();
    // Foo's slot 3 starts with `call Foo::slot2`
    let mut call = vec![0xE8];
    call.extend_from_slice(&((FOO_METHODS[2] as i32) - (FOO_METHODS[3] as i32 + 5)).to_le_bytes());
    call.extend_from_slice(&[0x48, 0x85, 0xC0]);
    b.write(FOO_METHODS[3], &call).unwrap();
    b.write(BAR_METHODS[0], &[0x48, 0x83, 0xEC, 0x28, 0xCC]).unwrap();

    write_type_descriptor(&mut b, TD_FOO, b".?AVFoo@@\0");
    write_type_descriptor(&mut b, TD_BAR, b".?AVBar@@\0");
    write_hierarchy(&mut b, CHD_FOO, TD_FOO, 1);
    write_hierarchy(&mut b, CHD_BAR, TD_BAR, 3);

    write_locator(&mut b, COL_FOO, 0, TD_FOO, CHD_FOO);
    write_locator(&mut b, COL_BAR, 0, TD_BAR, CHD_BAR);
    write_locator(&mut b, COL_BAR_SECONDARY, 16, TD_BAR, CHD_BAR);

    write_vtable(&mut b, META_FOO, COL_FOO, &FOO_METHODS);
    write_vtable(&mut b, META_BAR, COL_BAR, &BAR_METHODS);
    write_vtable(&mut b, META_BAR_SECONDARY, COL_BAR_SECONDARY, &BAR_SECONDARY_METHODS);

    b.build()
}

fn load_module() -> PeImage {
    PeImage::from_bytes(build_module()).unwrap()
}

fn raw(image: &PeImage, rva: u32) -> usize {
    image.rva_to_raw(rva).unwrap()
}

#[test]
fn test_end_to_end_ordinal() {
    let image = load_module();

    let pattern = Pattern::parse("55 8B EC ?? ??").unwrap();
    let prologue = scan_section(&image, ".text", &pattern).unwrap();
    assert_eq!(prologue, raw(&image, FOO_METHODS[2]));

    let vmts = find_vmts(&image).unwrap();
    let foo = &vmts["Foo"];
    assert_eq!(foo.method_count(), 4);
    assert_eq!(foo.method_index(prologue), Some(2));
}

#[test]
fn test_call_site_signature() {
    let image = load_module();

    // Match the call inside slot 3 and follow it to slot 2
    let pattern = Pattern::parse("E8 ? ? ? ? 48 85 C0").unwrap();
    let hit = scan_section(&image, ".text", &pattern).unwrap();
    assert_eq!(hit, raw(&image, FOO_METHODS[3]));

    let function = apply_steps(&image, hit, &[Step::RipRelative(1)]).unwrap();
    assert_eq!(function, raw(&image, FOO_METHODS[2]));

    let vmts = find_vmts(&image).unwrap();
    assert_eq!(vmts["Foo"].method_index(function), Some(2));
    assert_eq!(vmts["Bar"].method_index(function), Some(1));
    assert_eq!(vmts["Foo"].method_index(hit), Some(3));
}

#[test]
fn test_primary_only_retention() {
    let image = load_module();
    let vmts = find_vmts(&image).unwrap();

    assert_eq!(vmts.keys().collect::<Vec<_>>(), ["Bar", "Foo"]);
    let bar = &vmts["Bar"];
    assert_eq!(bar.address, raw(&image, META_BAR) + 8);
    assert_eq!(bar.method_count(), BAR_METHODS.len());
    assert_eq!(bar.methods(), &BAR_METHODS);

    // The secondary vtable's only method is not in the primary one
    assert_eq!(bar.method_index(raw(&image, BAR_SECONDARY_METHODS[0])), None);
}

#[test]
fn test_find_vmt_returns_first_by_name() {
    let image = load_module();
    let bar = find_vmt(&image, "Bar").unwrap().unwrap();
    assert_eq!(bar.address, raw(&image, META_BAR) + 8);
    assert!(find_vmt(&image, "Baz").unwrap().is_none());
}

#[test]
fn test_recovery_is_deterministic() {
    let image = load_module();
    assert_eq!(find_vmts(&image).unwrap(), find_vmts(&image).unwrap());

    let reloaded = load_module();
    assert_eq!(find_vmts(&image).unwrap(), find_vmts(&reloaded).unwrap());
}

#[test]
fn test_method_index_for_every_slot() {
    let image = load_module();
    let foo = find_vmts(&image).unwrap().remove("Foo").unwrap();

    for (slot, &rva) in FOO_METHODS.iter().enumerate() {
        assert_eq!(foo.method_index(raw(&image, rva)), Some(slot));
    }
    assert_eq!(foo.method_index(raw(&image, TEXT_RVA + 0x10)), None);
    assert_eq!(foo.method_index(raw(&image, RDATA_RVA)), None);
}

#[test]
fn test_steps_leaving_image_stop() {
    let image = load_module();
    let start = raw(&image, FOO_METHODS[2]);

    let steps = [
        Step::Offset(-(start as i64) - 0x10),
        Step::Offset(0x20),
        Step::Offset(start as i64),
    ];
    assert_eq!(apply_steps(&image, start, &steps), None);
    assert_eq!(apply_steps(&image, start, &steps[1..]), Some(start + 0x20 + start));
}

#[test]
fn test_missing_pattern() {
    let image = load_module();
    let pattern = Pattern::parse("0F 0B 0F 0B").unwrap();
    assert_eq!(scan_section(&image, ".text", &pattern), None);
    assert_eq!(scan_section(&image, ".nope", &pattern), None);
}

#[test]
fn test_verify_directory() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("game/bin")).unwrap();
    std::fs::write(root.path().join("game/bin/module.dll"), build_module()).unwrap();

    let doc = SignatureDocument::from_json(
        r#"{
            "game/bin/": {
                "module.dll": {
                    "Foo": {
                        "mappedName": "IFoo",
                        "methods": {
                            "Prologue": "55 8B EC ?? ??",
                            "ViaCall": { "pattern": "E8 ? ? ? ? 48 85 C0", "steps": [[0, 1]] }
                        }
                    },
                    "Bar": { "methods": { "Setup": "48 83 EC 28 CC" } }
                },
                "missing.dll": { "Foo": { "methods": { "Prologue": "55" } } }
            }
        }"#,
    )
    .unwrap();

    let mut verifier = Verifier::new(VerifyConfig::with_root(root.path()));
    let report = verifier.verify(&doc);

    assert_eq!(report.skipped_modules().count(), 1);
    assert_eq!(report.resolved_count(), 3);
    assert_eq!(report.unresolved_count(), 0);

    let ordinals = report.ordinals();
    assert_eq!(ordinals["IFoo"]["Prologue"], 2);
    assert_eq!(ordinals["IFoo"]["ViaCall"], 2);
    assert_eq!(ordinals["Bar"]["Setup"], 0);

    let json = serde_json::to_string(&ordinals).unwrap();
    assert_eq!(json, r#"{"Bar":{"Setup":0},"IFoo":{"Prologue":2,"ViaCall":2}}"#);
}
