//! The JSON signature document.
//!
//! ```json
//! { "bin/win64/": { "client.dll": { "CDOTAPlayerController": {
//!     "mappedName": "PlayerController",
//!     "methods": {
//!         "PrepareUnitOrders": "48 89 5C 24 ? 57",
//!         "IsLocal": { "pattern": "E8 ? ? ? ? 84 C0", "steps": [[0, 1]] }
//!     }
//! } } } }
//! ```
//!
//! Folders map to modules, modules to classes, classes to their method
//! signatures. A method signature is either a bare combo string or an object
//! with a `pattern` and optional resolution `steps`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::image::PeImage;
use crate::scanner::{scan_section, scan_section_all, Pattern};
use crate::steps::{apply_steps, Step};

/// Classes of one module, keyed by RTTI class name.
pub type ModuleSignatures = BTreeMap<String, ClassSignatures>;

/// Modules of one folder, keyed by file name.
pub type FolderSignatures = BTreeMap<String, ModuleSignatures>;

/// The whole signature document, keyed by folder relative to the root.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureDocument {
    pub folders: BTreeMap<String, FolderSignatures>,
}

impl SignatureDocument {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::from_read(path, e))?;
        let document = Self::from_json(&text)?;
        debug!(
            path = %path.display(),
            modules = document.module_count(),
            methods = document.method_count(),
            "loaded signature document"
        );
        Ok(document)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Every `(folder, module, classes)` entry in document order.
    pub fn modules(&self) -> impl Iterator<Item = (&str, &str, &ModuleSignatures)> + '_ {
        self.folders.iter().flat_map(|(folder, modules)| {
            modules
                .iter()
                .map(move |(module, classes)| (folder.as_str(), module.as_str(), classes))
        })
    }

    pub fn module_count(&self) -> usize {
        self.folders.values().map(BTreeMap::len).sum()
    }

    pub fn method_count(&self) -> usize {
        self.modules()
            .flat_map(|(_, _, classes)| classes.values())
            .map(|class| class.methods.len())
            .sum()
    }
}

/// Method signatures for one class.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassSignatures {
    /// Name to use for this class in the output document.
    #[serde(rename = "mappedName", default, skip_serializing_if = "Option::is_none")]
    pub mapped_name: Option<String>,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSignature>,
}

impl ClassSignatures {
    /// The mapped name if present, otherwise `class_name`.
    pub fn output_name<'a>(&'a self, class_name: &'a str) -> &'a str {
        self.mapped_name.as_deref().unwrap_or(class_name)
    }
}

/// One method's signature as written in the document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodSignature {
    Combo(String),
    Detailed {
        pattern: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        steps: Vec<Step>,
    },
}

impl MethodSignature {
    pub fn pattern(&self) -> &str {
        match self {
            MethodSignature::Combo(pattern) | MethodSignature::Detailed { pattern, .. } => pattern,
        }
    }

    pub fn steps(&self) -> &[Step] {
        match self {
            MethodSignature::Combo(_) => &[],
            MethodSignature::Detailed { steps, .. } => steps,
        }
    }

    /// Compile the combo string into a searchable [`SignatureSpec`].
    pub fn compile(&self) -> Result<SignatureSpec> {
        Ok(SignatureSpec {
            pattern: Pattern::parse(self.pattern())?,
            steps: self.steps().to_vec(),
        })
    }
}

/// A compiled signature: what to search for and how to get from the match to
/// the function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureSpec {
    pub pattern: Pattern,
    pub steps: Vec<Step>,
}

/// Where resolving a signature stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The pattern did not match inside the section.
    NotFound,
    /// The pattern matched at `matched` but a step left the image.
    OutOfBounds { matched: usize },
    /// The function's raw file offset.
    Resolved { matched: usize, function: usize },
}

impl Resolution {
    pub fn function(&self) -> Option<usize> {
        match self {
            Resolution::Resolved { function, .. } => Some(*function),
            _ => None,
        }
    }
}

impl SignatureSpec {
    pub fn new(pattern: Pattern, steps: Vec<Step>) -> Self {
        Self { pattern, steps }
    }

    /// Scan `section` for the first match and apply the steps to it.
    pub fn resolve(&self, image: &PeImage, section: &str) -> Resolution {
        let Some(matched) = scan_section(image, section, &self.pattern) else {
            return Resolution::NotFound;
        };
        match apply_steps(image, matched, &self.steps) {
            Some(function) => Resolution::Resolved { matched, function },
            None => Resolution::OutOfBounds { matched },
        }
    }

    /// Number of places the pattern matches in `section`.
    pub fn match_count(&self, image: &PeImage, section: &str) -> usize {
        scan_section_all(image, section, &self.pattern).len()
    }
}
