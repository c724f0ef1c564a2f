//! Batch signature verification.
//!
//! For every module named in a [`SignatureDocument`] the verifier:
//! 1. Loads `<root>/<folder>/<module>` (skipping it if that fails)
//! 2. Recovers the module's primary VMTs
//! 3. Scans the code section for each method signature and applies its steps
//! 4. Looks the resolved function up in the class's VMT to get its ordinal
//!
//! The result is a [`VerifyReport`] that can be printed and turned into the
//! `class -> method -> ordinal` output map.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::image::PeImage;
use crate::rtti::{find_vmts, Vmt};
use crate::signature::{ClassSignatures, MethodSignature, Resolution, SignatureDocument};

/// `mapped class name -> method -> ordinal`.
pub type OrdinalMap = BTreeMap<String, BTreeMap<String, usize>>;

/// Progress stage during verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Initializing,
    LoadingModule,
    RecoveringVtables,
    ResolvingSignatures,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::LoadingModule => "Loading module",
            Self::RecoveringVtables => "Recovering vtables",
            Self::ResolvingSignatures => "Resolving signatures",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during verification.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    pub stage: ProgressStage,
    /// Module being processed, as `folder + file name`.
    pub current_item: Option<String>,
    /// Modules finished so far.
    pub current: usize,
    /// Modules in the document.
    pub total: usize,
    /// Size of the current module's file.
    pub module_bytes: usize,
    /// VMTs recovered from the current module.
    pub vtables_found: usize,
    /// Methods resolved to an ordinal so far.
    pub methods_resolved: usize,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Initializing,
            current_item: None,
            current: 0,
            total: 0,
            module_bytes: 0,
            vtables_found: 0,
            methods_resolved: 0,
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for a verification run.
pub struct VerifyConfig {
    /// Directory the document's folder keys are relative to.
    pub root: PathBuf,
    /// Section the signatures are scanned in.
    pub code_section: String,
    /// Count every match of each resolved signature to flag ambiguous ones.
    pub report_ambiguous: bool,
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for VerifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyConfig")
            .field("root", &self.root)
            .field("code_section", &self.code_section)
            .field("report_ambiguous", &self.report_ambiguous)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            code_section: ".text".to_string(),
            report_ambiguous: false,
            progress_callback: None,
        }
    }
}

impl VerifyConfig {
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

/// A loaded image together with its recovered primary VMTs.
#[derive(Debug)]
pub struct LoadedModule {
    pub image: PeImage,
    pub vmts: BTreeMap<String, Vmt>,
}

impl LoadedModule {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_image(PeImage::load(path)?)
    }

    pub fn from_image(image: PeImage) -> Result<Self> {
        let vmts = find_vmts(&image)?;
        Ok(Self { image, vmts })
    }
}

/// Outcome of resolving one method signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodStatus {
    /// The function sits in slot `ordinal` of the class's VMT.
    Resolved { ordinal: usize, function: usize },
    /// The combo string does not compile.
    InvalidSignature(String),
    PatternNotFound,
    /// A step took the address outside the image.
    StepsOutOfBounds { matched: usize },
    /// The module has no primary VMT for the class.
    ClassNotFound { function: usize },
    /// The class's VMT has no slot pointing at the function.
    NotInVmt { function: usize },
}

impl MethodStatus {
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            MethodStatus::Resolved { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }
}

impl std::fmt::Display for MethodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodStatus::Resolved { ordinal, .. } => write!(f, "{ordinal}"),
            MethodStatus::InvalidSignature(reason) => write!(f, "INVALID SIGNATURE ({reason})"),
            MethodStatus::PatternNotFound => write!(f, "NOT FOUND"),
            MethodStatus::StepsOutOfBounds { matched } => {
                write!(f, "OUT OF BOUNDS (match at 0x{matched:X})")
            }
            MethodStatus::ClassNotFound { function } => {
                write!(f, "NO VMT (function at 0x{function:X})")
            }
            MethodStatus::NotInVmt { function } => {
                write!(f, "NOT IN VMT (function at 0x{function:X})")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodReport {
    pub name: String,
    pub status: MethodStatus,
    /// How many times the pattern matched, when ambiguity reporting is on.
    pub match_count: Option<usize>,
}

impl MethodReport {
    pub fn is_ambiguous(&self) -> bool {
        self.match_count.is_some_and(|n| n > 1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassReport {
    /// RTTI class name as written in the document.
    pub name: String,
    /// Key used for this class in the output map.
    pub output_name: String,
    /// Method count of the class's VMT, if one was recovered.
    pub vmt_methods: Option<usize>,
    pub methods: Vec<MethodReport>,
}

#[derive(Debug)]
pub struct ModuleReport {
    pub folder: String,
    pub module: String,
    pub path: PathBuf,
    /// Why the module was skipped, if it was.
    pub error: Option<String>,
    pub vmt_count: usize,
    pub classes: Vec<ClassReport>,
}

impl ModuleReport {
    pub fn is_skipped(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub modules: Vec<ModuleReport>,
}

impl VerifyReport {
    fn methods(&self) -> impl Iterator<Item = &MethodReport> + '_ {
        self.modules
            .iter()
            .flat_map(|m| &m.classes)
            .flat_map(|c| &c.methods)
    }

    pub fn resolved_count(&self) -> usize {
        self.methods().filter(|m| m.status.ordinal().is_some()).count()
    }

    pub fn unresolved_count(&self) -> usize {
        self.methods().filter(|m| m.status.ordinal().is_none()).count()
    }

    pub fn ambiguous_count(&self) -> usize {
        self.methods().filter(|m| m.is_ambiguous()).count()
    }

    pub fn skipped_modules(&self) -> impl Iterator<Item = &ModuleReport> + '_ {
        self.modules.iter().filter(|m| m.is_skipped())
    }

    /// Every method resolved and no module skipped.
    pub fn is_complete(&self) -> bool {
        self.unresolved_count() == 0 && self.skipped_modules().next().is_none()
    }

    /// What kept the run from being complete, or `None` if it was.
    pub fn incomplete_reason(&self) -> Option<String> {
        let unresolved = self.unresolved_count();
        let skipped = self.skipped_modules().count();
        match (unresolved, skipped) {
            (0, 0) => None,
            (n, 0) => Some(format!("{n} signatures unresolved")),
            (0, m) => Some(format!("{m} modules skipped")),
            (n, m) => Some(format!("{n} signatures unresolved, {m} modules skipped")),
        }
    }

    /// Resolved ordinals keyed by output class name. Unresolved methods are
    /// left out.
    pub fn ordinals(&self) -> OrdinalMap {
        let mut out = OrdinalMap::new();
        for class in self.modules.iter().flat_map(|m| &m.classes) {
            for method in &class.methods {
                if let Some(ordinal) = method.status.ordinal() {
                    out.entry(class.output_name.clone())
                        .or_default()
                        .insert(method.name.clone(), ordinal);
                }
            }
        }
        out
    }
}

/// Runs signature documents against modules on disk, caching each loaded
/// module by path.
pub struct Verifier {
    config: VerifyConfig,
    modules: HashMap<PathBuf, LoadedModule>,
}

impl Verifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self {
            config,
            modules: HashMap::new(),
        }
    }

    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    /// Load `path` or return the cached module.
    pub fn module(&mut self, path: &Path) -> Result<&LoadedModule> {
        cached_module(&mut self.modules, path)
    }

    pub fn verify(&mut self, document: &SignatureDocument) -> VerifyReport {
        let config = &self.config;
        let modules = &mut self.modules;

        let mut progress = ProgressInfo {
            total: document.module_count(),
            ..Default::default()
        };
        let report = |p: &ProgressInfo| {
            if let Some(ref cb) = config.progress_callback {
                cb(p);
            }
        };
        report(&progress);

        let mut out = VerifyReport::default();

        for (folder, module_name, classes) in document.modules() {
            // Keys are relative to the root even when written with a leading separator
            let path = config
                .root
                .join(folder.trim_start_matches(['/', '\\']))
                .join(module_name);

            progress.current_item = Some(format!("{folder}{module_name}"));
            progress.stage = ProgressStage::LoadingModule;
            progress.module_bytes = 0;
            progress.vtables_found = 0;
            report(&progress);

            let mut module_report = ModuleReport {
                folder: folder.to_string(),
                module: module_name.to_string(),
                path: path.clone(),
                error: None,
                vmt_count: 0,
                classes: Vec::new(),
            };

            let loaded = match cached_module(modules, &path) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping module");
                    module_report.error = Some(e.to_string());
                    out.modules.push(module_report);
                    progress.current += 1;
                    continue;
                }
            };

            progress.stage = ProgressStage::RecoveringVtables;
            progress.module_bytes = loaded.image.data().len();
            progress.vtables_found = loaded.vmts.len();
            report(&progress);
            module_report.vmt_count = loaded.vmts.len();

            progress.stage = ProgressStage::ResolvingSignatures;
            report(&progress);

            for (class_name, signatures) in classes {
                let class = verify_class(loaded, class_name, signatures, config);
                progress.methods_resolved += class
                    .methods
                    .iter()
                    .filter(|m| m.status.ordinal().is_some())
                    .count();
                module_report.classes.push(class);
            }

            debug!(
                path = %path.display(),
                classes = module_report.classes.len(),
                "verified module"
            );
            out.modules.push(module_report);
            progress.current += 1;
        }

        progress.stage = ProgressStage::Complete;
        progress.current_item = None;
        report(&progress);

        info!(
            resolved = out.resolved_count(),
            unresolved = out.unresolved_count(),
            skipped = out.skipped_modules().count(),
            "verification finished"
        );
        out
    }
}

fn cached_module<'m>(
    modules: &'m mut HashMap<PathBuf, LoadedModule>,
    path: &Path,
) -> Result<&'m LoadedModule> {
    if !modules.contains_key(path) {
        let loaded = LoadedModule::load(path)?;
        debug!(path = %path.display(), vtables = loaded.vmts.len(), "cached module");
        modules.insert(path.to_path_buf(), loaded);
    }
    // Inserted above if it was missing
    Ok(&modules[path])
}

/// Resolve every method of one class against an already loaded module.
pub fn verify_class(
    module: &LoadedModule,
    class_name: &str,
    signatures: &ClassSignatures,
    config: &VerifyConfig,
) -> ClassReport {
    let vmt = module.vmts.get(class_name);
    if vmt.is_none() {
        warn!(class = class_name, "no VMT recovered for class");
    }

    let methods = signatures
        .methods
        .iter()
        .map(|(name, signature)| verify_method(module, vmt, name, signature, config))
        .collect();

    ClassReport {
        name: class_name.to_string(),
        output_name: signatures.output_name(class_name).to_string(),
        vmt_methods: vmt.map(Vmt::method_count),
        methods,
    }
}

fn verify_method(
    module: &LoadedModule,
    vmt: Option<&Vmt>,
    name: &str,
    signature: &MethodSignature,
    config: &VerifyConfig,
) -> MethodReport {
    let spec = match signature.compile() {
        Ok(spec) => spec,
        Err(e) => {
            return MethodReport {
                name: name.to_string(),
                status: MethodStatus::InvalidSignature(e.to_string()),
                match_count: None,
            }
        }
    };

    let status = match spec.resolve(&module.image, &config.code_section) {
        Resolution::NotFound => MethodStatus::PatternNotFound,
        Resolution::OutOfBounds { matched } => MethodStatus::StepsOutOfBounds { matched },
        Resolution::Resolved { function, .. } => match vmt {
            None => MethodStatus::ClassNotFound { function },
            Some(vmt) => match vmt.method_index(function) {
                Some(ordinal) => MethodStatus::Resolved { ordinal, function },
                None => MethodStatus::NotInVmt { function },
            },
        },
    };

    let match_count = (config.report_ambiguous && status != MethodStatus::PatternNotFound)
        .then(|| spec.match_count(&module.image, &config.code_section));

    MethodReport {
        name: name.to_string(),
        status,
        match_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PeBuilder;
    use crate::pe::{
        CODE_SECTION_CHARACTERISTICS, DATA_SECTION_CHARACTERISTICS,
        RDATA_SECTION_CHARACTERISTICS,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TEXT: u32 = 0x1000;
    const RDATA: u32 = 0x2000;
    const DATA: u32 = 0x3000;

    /// `Foo` with three methods at `.text+0x00/0x20/0x40`. Method 2 starts
    /// with `55 8B EC 90 90`, method 0 is `call method2` at `.text+0x00`.
    fn foo_module() -> Vec<u8> {
        let mut b = PeBuilder::new(0x1_8000_0000);
        assert_eq!(b.add_section(".text", CODE_SECTION_CHARACTERISTICS, 0x100), TEXT);
        assert_eq!(b.add_section(".rdata", RDATA_SECTION_CHARACTERISTICS, 0x1000), RDATA);
        assert_eq!(b.add_section(".data", DATA_SECTION_CHARACTERISTICS, 0x100), DATA);

        let mut call = vec![0xE8];
        call.extend_from_slice(&(0x40i32 - 5).to_le_bytes());
        b.write(TEXT, &call).unwrap();
        b.write(TEXT + 0x20, &[0xC3]).unwrap();
        b.write(TEXT + 0x40, &[0x55, 0x8B, 0xEC, 0x90, 0x90]).unwrap();

        // TypeDescriptor
        b.write_va(DATA, RDATA + 0xF00).unwrap();
        b.write(DATA + 0x10, b".?AVFoo@@\0").unwrap();

        // ClassHierarchyDescriptor, BaseClassArray, BaseClassDescriptor
        let chd = RDATA + 0x100;
        b.write_u32(chd + 4, 0).unwrap();
        b.write_u32(chd + 8, 1).unwrap();
        b.write_u32(chd + 12, chd + 0x10).unwrap();
        b.write_u32(chd + 0x10, chd + 0x20).unwrap();
        b.write_u32(chd + 0x20, DATA).unwrap();

        // CompleteObjectLocator
        let col = RDATA + 0x80;
        b.write_u32(col, 1).unwrap();
        b.write_u32(col + 12, DATA).unwrap();
        b.write_u32(col + 16, chd).unwrap();
        b.write_u32(col + 20, col).unwrap();

        // meta pointer and three slots
        let meta = RDATA + 0x400;
        b.write_va(meta, col).unwrap();
        for (i, f) in [0u32, 0x20, 0x40].into_iter().enumerate() {
            b.write_va(meta + 8 + i as u32 * 8, TEXT + f).unwrap();
        }
        b.build()
    }

    const DOCUMENT: &str = r#"{
        "bin/": {
            "foo.dll": {
                "Foo": {
                    "mappedName": "MappedFoo",
                    "methods": {
                        "Prologue": "55 8B EC ? ?",
                        "ViaCall": { "pattern": "E8 ? ? ? ? 00", "steps": [[0, 1]] },
                        "First": "E8 3B 00 00 00",
                        "Missing": "DE AD BE EF",
                        "Escapes": { "pattern": "55 8B EC", "steps": [[1, 16777216]] },
                        "Broken": "55 ZZ",
                        "Nop": "90"
                    }
                },
                "Bar": { "methods": { "Prologue": "55 8B EC" } }
            },
            "absent.dll": { "Baz": { "methods": { "X": "90" } } }
        }
    }"#;

    fn run(config: VerifyConfig) -> VerifyReport {
        let doc = SignatureDocument::from_json(DOCUMENT).unwrap();
        Verifier::new(config).verify(&doc)
    }

    fn root_with_foo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/foo.dll"), foo_module()).unwrap();
        dir
    }

    fn status<'r>(report: &'r VerifyReport, class: &str, method: &str) -> &'r MethodReport {
        report
            .modules
            .iter()
            .flat_map(|m| &m.classes)
            .find(|c| c.name == class)
            .and_then(|c| c.methods.iter().find(|m| m.name == method))
            .unwrap()
    }

    #[test]
    fn test_verify_config_default() {
        let config = VerifyConfig::default();
        assert_eq!(config.code_section, ".text");
        assert!(!config.report_ambiguous);
        assert!(config.progress_callback.is_none());
        assert!(format!("{config:?}").contains("progress_callback: false"));
    }

    #[test]
    fn test_progress_stage_names() {
        assert_eq!(ProgressStage::Initializing.name(), "Initializing");
        assert_eq!(ProgressStage::ResolvingSignatures.name(), "Resolving signatures");
        assert_eq!(ProgressStage::Complete.name(), "Complete");
    }

    #[test]
    fn test_method_statuses() {
        let dir = root_with_foo();
        let report = run(VerifyConfig::with_root(dir.path()));
        let text = foo_raw_text();

        assert_eq!(
            status(&report, "Foo", "Prologue").status,
            MethodStatus::Resolved { ordinal: 2, function: text + 0x40 }
        );
        assert_eq!(status(&report, "Foo", "ViaCall").status.ordinal(), Some(2));
        assert_eq!(status(&report, "Foo", "First").status.ordinal(), Some(0));
        assert_eq!(status(&report, "Foo", "Missing").status, MethodStatus::PatternNotFound);
        assert!(matches!(
            status(&report, "Foo", "Escapes").status,
            MethodStatus::StepsOutOfBounds { .. }
        ));
        assert!(matches!(
            status(&report, "Foo", "Broken").status,
            MethodStatus::InvalidSignature(_)
        ));
        assert!(matches!(
            status(&report, "Foo", "Nop").status,
            MethodStatus::NotInVmt { .. }
        ));
        assert!(matches!(
            status(&report, "Bar", "Prologue").status,
            MethodStatus::ClassNotFound { .. }
        ));
    }

    fn foo_raw_text() -> usize {
        PeImage::from_bytes(foo_module())
            .unwrap()
            .rva_to_raw(TEXT)
            .unwrap()
    }

    #[test]
    fn test_missing_module_is_skipped() {
        let dir = root_with_foo();
        let report = run(VerifyConfig::with_root(dir.path()));

        assert_eq!(report.modules.len(), 2);
        let skipped: Vec<_> = report.skipped_modules().map(|m| m.module.as_str()).collect();
        assert_eq!(skipped, ["absent.dll"]);
        assert!(report.modules[0].classes.len() == 2 || report.modules[1].classes.len() == 2);
        assert!(!report.is_complete());
        assert_eq!(
            report.incomplete_reason().as_deref(),
            Some("5 signatures unresolved, 1 modules skipped")
        );
    }

    #[test]
    fn test_incomplete_reason_counts_skipped_modules() {
        let dir = root_with_foo();
        let doc = SignatureDocument::from_json(
            r#"{ "bin/": {
                "foo.dll": { "Foo": { "methods": { "Prologue": "55 8B EC ? ?" } } },
                "absent.dll": { "Baz": { "methods": { "X": "90" } } }
            } }"#,
        )
        .unwrap();
        let report = Verifier::new(VerifyConfig::with_root(dir.path())).verify(&doc);

        assert_eq!(report.unresolved_count(), 0);
        assert!(!report.is_complete());
        assert_eq!(report.incomplete_reason().as_deref(), Some("1 modules skipped"));

        assert_eq!(VerifyReport::default().incomplete_reason(), None);
    }

    #[test]
    fn test_folder_with_leading_separator_stays_under_root() {
        let dir = root_with_foo();
        let doc = SignatureDocument::from_json(
            r#"{
                "/bin/": { "foo.dll": { "Foo": { "methods": { "Prologue": "55 8B EC ? ?" } } } },
                "\\bin/": { "foo.dll": { "Foo": { "methods": { "First": "E8 3B 00 00 00" } } } }
            }"#,
        )
        .unwrap();
        let report = Verifier::new(VerifyConfig::with_root(dir.path())).verify(&doc);

        assert_eq!(report.skipped_modules().count(), 0);
        assert!(report.modules.iter().all(|m| m.path == dir.path().join("bin/foo.dll")));
        assert_eq!(report.resolved_count(), 2);
        assert!(report.is_complete());
    }

    #[test]
    fn test_ordinals_use_mapped_name() {
        let dir = root_with_foo();
        let report = run(VerifyConfig::with_root(dir.path()));
        let ordinals = report.ordinals();

        assert_eq!(ordinals.len(), 1);
        let foo = &ordinals["MappedFoo"];
        assert_eq!(foo.len(), 3);
        assert_eq!(foo["Prologue"], 2);
        assert_eq!(foo["ViaCall"], 2);
        assert_eq!(foo["First"], 0);
        assert_eq!(report.resolved_count(), 3);
        assert_eq!(report.unresolved_count(), 5);
    }

    #[test]
    fn test_ambiguity_reporting() {
        let dir = root_with_foo();
        let quiet = run(VerifyConfig::with_root(dir.path()));
        assert!(quiet.methods().all(|m| m.match_count.is_none()));

        let loud = run(VerifyConfig {
            report_ambiguous: true,
            ..VerifyConfig::with_root(dir.path())
        });
        assert_eq!(status(&loud, "Foo", "Prologue").match_count, Some(1));
        assert_eq!(status(&loud, "Foo", "Missing").match_count, None);
        // 90 90 in method 2 matches twice
        assert!(status(&loud, "Foo", "Nop").is_ambiguous());
        assert_eq!(loud.ambiguous_count(), 1);
    }

    #[test]
    fn test_progress_callback() {
        let dir = root_with_foo();
        let calls = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let (c, done) = (calls.clone(), completed.clone());

        run(VerifyConfig {
            progress_callback: Some(Box::new(move |info: &ProgressInfo| {
                c.fetch_add(1, Ordering::SeqCst);
                assert_eq!(info.total, 2);
                if info.stage == ProgressStage::Complete {
                    done.store(info.methods_resolved, Ordering::SeqCst);
                }
            })),
            ..VerifyConfig::with_root(dir.path())
        });

        assert!(calls.load(Ordering::SeqCst) > 2);
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_module_cache() {
        let dir = root_with_foo();
        let path = dir.path().join("bin/foo.dll");
        let mut verifier = Verifier::new(VerifyConfig::with_root(dir.path()));

        let first = verifier.module(&path).unwrap().vmts.len();
        std::fs::remove_file(&path).unwrap();
        // Served from the cache after the file is gone
        assert_eq!(verifier.module(&path).unwrap().vmts.len(), first);
        assert!(verifier.module(&dir.path().join("nope.dll")).is_err());
    }
}
