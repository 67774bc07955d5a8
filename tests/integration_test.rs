//! End-to-end tests over synthetic images.
//!
//! The layout used by the PE tests:
//! - Image at 0x180000000, `.text` at RVA 0x1000 (file offset 0x200)
//!   - 0x1000: clamp idiom, only reached as an undeclared call target
//!   - 0x1040: `Character.HumanBody:Update`, calls 0x1000
//!   - 0x1050: `UnityEngine.Animator:Update`, calls 0x1000 (pre-filtered)
//!   - 0x1080: a second clamp, declared on an engine type (rejected)

use std::fs;
use std::path::PathBuf;

use iced_x86::{Decoder, DecoderOptions, Mnemonic};

use unclamp::patch::BufferWriter;
use unclamp::{
    apply_patches, scan_methods, BlockPath, ClampMatcher, Explorer, ImageView, MappedImage,
    MethodInfo, MethodTable, PatchRecord, PatchSource, RuleSet, ScanConfig, Session,
    SessionConfig,
};

const IMAGE_BASE: u64 = 0x180000000;
const TEXT_RVA: u64 = 0x1000;
const TEXT_FILE_OFFSET: usize = 0x200;

const CLAMP_RVA: u64 = TEXT_RVA;
const ENGINE_CLAMP_RVA: u64 = TEXT_RVA + 0x80;

/// `movss xmm2, [one]; comiss xmm1, xmm2; ja L1; comiss xmm1, xmm3; jbe L2;
/// movaps xmm1, xmm3; jmp L2; L1: xorps xmm1, xmm1; L2: ret`, then `1.0f`.
const CLAMP: [u8; 40] = [
    0xF3, 0x0F, 0x10, 0x15, 0x14, 0x00, 0x00, 0x00, // 0: movss xmm2, [rip+0x14]
    0x0F, 0x2F, 0xCA, // 8: comiss xmm1, xmm2
    0x77, 0x0A, // 11: ja 23
    0x0F, 0x2F, 0xCB, // 13: comiss xmm1, xmm3
    0x76, 0x08, // 16: jbe 26
    0x0F, 0x28, 0xCB, // 18: movaps xmm1, xmm3
    0xEB, 0x03, // 21: jmp 26
    0x0F, 0x57, 0xC9, // 23: xorps xmm1, xmm1
    0xC3, // 26: ret
    0xCC, // 27
    0x00, 0x00, 0x80, 0x3F, // 28: 1.0f32
    0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC,
];

const METHODS_JSON: &str = r#"{ "methods": [
    { "rva": 4160, "assembly": "Assembly-CSharp.dll",
      "typeName": "Character.HumanBody", "name": "Update" },
    { "rva": 4176, "assembly": "UnityEngine.AnimationModule.dll",
      "typeName": "UnityEngine.Animator", "name": "Update" },
    { "rva": 4224, "assembly": "ILGLib.dll",
      "typeName": "UnityEngine.MathfEx", "name": "Clamp01" }
] }"#;

fn text_section() -> Vec<u8> {
    let mut code = vec![0xCC; 0xA8];
    code[..40].copy_from_slice(&CLAMP);
    // call 0x1000; ret
    code[0x40..0x46].copy_from_slice(&[0xE8, 0xBB, 0xFF, 0xFF, 0xFF, 0xC3]);
    code[0x50..0x56].copy_from_slice(&[0xE8, 0xAB, 0xFF, 0xFF, 0xFF, 0xC3]);
    code[0x80..0xA8].copy_from_slice(&CLAMP);
    code
}

fn put(file: &mut [u8], offset: usize, bytes: &[u8]) {
    file[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Minimal PE32+ with a single `.text` section.
fn build_pe(code: &[u8]) -> Vec<u8> {
    let mut file = vec![0u8; 0x400];
    put(&mut file, 0, b"MZ");
    put(&mut file, 0x3C, &0x80u32.to_le_bytes());

    put(&mut file, 0x80, b"PE\0\0");
    put(&mut file, 0x84, &0x8664u16.to_le_bytes());
    put(&mut file, 0x86, &1u16.to_le_bytes());
    put(&mut file, 0x94, &0xF0u16.to_le_bytes());

    let opt = 0x98;
    put(&mut file, opt, &0x20Bu16.to_le_bytes());
    put(&mut file, opt + 24, &IMAGE_BASE.to_le_bytes());
    put(&mut file, opt + 32, &0x1000u32.to_le_bytes());
    put(&mut file, opt + 36, &0x200u32.to_le_bytes());
    put(&mut file, opt + 56, &0x2000u32.to_le_bytes());
    put(&mut file, opt + 60, &0x200u32.to_le_bytes());

    let sec = opt + 0xF0;
    put(&mut file, sec, b".text");
    put(&mut file, sec + 8, &(code.len() as u32).to_le_bytes());
    put(&mut file, sec + 12, &(TEXT_RVA as u32).to_le_bytes());
    put(&mut file, sec + 16, &0x200u32.to_le_bytes());
    put(&mut file, sec + 20, &(TEXT_FILE_OFFSET as u32).to_le_bytes());
    put(&mut file, sec + 36, &0x6000_0020u32.to_le_bytes());

    put(&mut file, TEXT_FILE_OFFSET, code);
    file
}

struct Workspace {
    dir: tempfile::TempDir,
    file: Vec<u8>,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let file = build_pe(&text_section());
        fs::write(dir.path().join("GameAssembly.dll"), &file).unwrap();
        fs::write(dir.path().join("methods.json"), METHODS_JSON).unwrap();
        Self { dir, file }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(
            self.path("config"),
            self.path("state"),
            self.path("GameAssembly.dll"),
            self.path("methods.json"),
        );
        config.probes.clear();
        config
    }

    /// Scan, patch and write back; returns the plan source and patched file.
    fn patch(&self) -> (PatchSource, usize, Vec<u8>) {
        let mut image = MappedImage::map(&self.file).unwrap();
        let session = Session::open(self.config()).unwrap();
        let plan = session.plan(&image.view());

        let base = image.image_base();
        let size = image.bytes().len();
        let mut writer = BufferWriter::new(base, image.bytes_mut());
        let stats = session.apply(&plan, &mut writer, base, size);
        assert_eq!(stats.skipped, 0);

        let mut patched = self.file.clone();
        image.write_back(&mut patched).unwrap();
        (plan.source, stats.applied, patched)
    }
}

fn decode_at(bytes: &[u8], offset: usize, ip: u64) -> iced_x86::Instruction {
    Decoder::with_ip(64, &bytes[offset..], ip, DecoderOptions::NONE).decode()
}

/// The bare clamp: one block, a candidate, and two rewrites that keep the
/// unclamped path.
#[test]
fn test_clamp_scenario() {
    let view = ImageView::new(IMAGE_BASE, &CLAMP);
    let index = Explorer::new(&view).explore(IMAGE_BASE);

    assert_eq!(index.len(), 1, "every branch stays inside the block");
    let block = &index.blocks()[0];
    assert_eq!(block.start(), IMAGE_BASE);
    assert_eq!(block.end(), IMAGE_BASE + 27);

    let matcher = ClampMatcher::new(&view);
    assert!(matcher.has_candidate(block));

    let patches: Vec<PatchRecord> = matcher
        .find_rewrites(block)
        .iter()
        .map(|r| PatchRecord::encode(r, IMAGE_BASE).unwrap())
        .collect();
    let sites: Vec<u64> = patches.iter().map(|p| p.rva).collect();
    assert_eq!(sites, vec![11, 16]);

    let mut patched = CLAMP;
    let stats = apply_patches(
        &mut BufferWriter::new(IMAGE_BASE, &mut patched),
        IMAGE_BASE,
        CLAMP.len(),
        &patches,
    );
    assert_eq!(stats.applied, 2);

    // ja L1 now falls through to the second compare
    let first = decode_at(&patched, 11, IMAGE_BASE + 11);
    assert_eq!(first.mnemonic(), Mnemonic::Jmp);
    assert_eq!(first.near_branch_target(), IMAGE_BASE + 13);

    // jbe L2 is always taken
    let second = decode_at(&patched, 16, IMAGE_BASE + 16);
    assert_eq!(second.mnemonic(), Mnemonic::Jmp);
    assert_eq!(second.near_branch_target(), IMAGE_BASE + 26);

    println!("clamp scenario patched at {:?}", sites);
}

/// Offline image: only in-scope sites are written back to the file, and a
/// second run replays the cache.
#[test]
fn test_offline_image_end_to_end() {
    let ws = Workspace::new();

    let (source, applied, patched) = ws.patch();
    assert_eq!(source, PatchSource::FreshScan);
    assert_eq!(applied, 2);

    let clamp = TEXT_FILE_OFFSET + (CLAMP_RVA - TEXT_RVA) as usize;
    assert_eq!(&patched[clamp + 11..clamp + 13], &[0xEB, 0x00]);
    assert_eq!(&patched[clamp + 16..clamp + 18], &[0xEB, 0x08]);

    // rejected engine clamp stays intact
    let engine = TEXT_FILE_OFFSET + (ENGINE_CLAMP_RVA - TEXT_RVA) as usize;
    assert_eq!(&patched[engine..engine + 40], &CLAMP);

    let changed = patched.iter().zip(&ws.file).filter(|(a, b)| a != b).count();
    assert_eq!(changed, 3);

    let (source, applied, patched_again) = ws.patch();
    assert_eq!(source, PatchSource::Cache);
    assert_eq!(applied, 2);
    assert_eq!(patched_again, patched);

    let cache_files: Vec<_> = fs::read_dir(ws.path("state"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(cache_files.len(), 1);
    assert!(cache_files[0].starts_with("scan_cache_"));
}

/// The cache records every block, matched or not, with its reach paths.
#[test]
fn test_cache_contents() {
    let ws = Workspace::new();
    ws.patch();

    let session = Session::open(ws.config()).unwrap();
    let text = fs::read_to_string(session.cache().path()).unwrap();

    assert!(text.starts_with("version:1\nva_base:180000000\ncache_keys:{"));
    assert!(text.contains(
        "block: VA:180001000 Matched:True\n  \
         {Assembly-CSharp.dll::Character.HumanBody:Update()};sub0^entry\n    \
         patch: VA:18000100b EB00\n    \
         patch: VA:180001010 EB08\n\n"
    ));
    assert!(text.contains(
        "block: VA:180001080 Matched:False\n  \
         {ILGLib.dll::UnityEngine.MathfEx:Clamp01()}^entry\n"
    ));
    // pre-filtered root never shows up
    assert!(!text.contains("Animator"));
}

/// Empty rule documents grant nothing: with no Include vote, no site is in
/// scope and the image is left untouched.
#[test]
fn test_empty_rules_fail_closed() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.path("config")).unwrap();
    fs::write(ws.path("config").join("pre_filter.json"), "[]").unwrap();
    fs::write(ws.path("config").join("filter.json"), "[]").unwrap();

    let (source, applied, patched) = ws.patch();
    assert_eq!(source, PatchSource::FreshScan);
    assert_eq!(applied, 0);
    assert_eq!(patched, ws.file);

    // even with every root walked, an empty filter matches nothing
    let image = MappedImage::map(&ws.file).unwrap();
    let methods = MethodTable::load(&ws.path("methods.json")).unwrap();
    let result = scan_methods(
        &image.view(),
        &methods,
        &RuleSet::from_json(b"[{}]").unwrap(),
        &RuleSet::from_json(b"[]").unwrap(),
        &[],
        &ScanConfig::default(),
    );
    assert_eq!(result.blocks.len(), 2);
    assert!(result.blocks.values().all(|b| !b.matched));
}

/// One site, two paths: an Include for one outranks an Exclude for the other,
/// whatever the rule order.
#[test]
fn test_include_outranks_exclude() {
    let method = |type_name: &str| MethodInfo {
        rva: 0x1000,
        assembly: "Assembly-CSharp.dll".to_string(),
        type_name: type_name.to_string(),
        name: "Update".to_string(),
        parameters: Vec::new(),
    };
    let a = BlockPath::root(vec![method("Character.HumanBody")].into());
    let b = BlockPath::root(vec![method("CameraControl")].into());

    let exclude_first = RuleSet::from_json(
        br#"[ { "path": [ { "typeName": "Camera" } ], "action": "Exclude" },
              { "path": [ { "typeName": "Character." } ], "action": "Include" } ]"#,
    )
    .unwrap();
    let include_first = RuleSet::from_json(
        br#"[ { "path": [ { "typeName": "Character." } ], "action": "Include" },
              { "path": [ { "typeName": "Camera" } ], "action": "Exclude" } ]"#,
    )
    .unwrap();

    for rules in [&exclude_first, &include_first] {
        assert!(rules.is_in_scope([&a, &b]));
        assert!(rules.is_in_scope([&b, &a]));
        assert!(!rules.is_in_scope([&b]));
    }
}

/// A broken method table degrades to patching nothing.
#[test]
fn test_broken_metadata_patches_nothing() {
    let ws = Workspace::new();
    fs::write(ws.path("methods.json"), "not json").unwrap();

    let (source, applied, patched) = ws.patch();
    assert_eq!(source, PatchSource::Unavailable);
    assert_eq!(applied, 0);
    assert_eq!(patched, ws.file);
    assert!(!ws.path("state").exists());
}
