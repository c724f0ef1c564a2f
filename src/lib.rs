//! # vmtsig
//!
//! Recovers MSVC virtual method tables from x64 PE images on disk and resolves
//! byte signatures to vtable ordinals.
//!
//! ## Overview
//!
//! Game and application updates shuffle virtual methods around. Given a
//! signature for a method's code, this crate answers "which slot of class
//! `Foo`'s vtable points at it?" without running the binary:
//!
//! 1. Load the image and parse its section table ([`PeImage`])
//! 2. Sweep `.rdata` for vtables introduced by a valid RTTI chain ([`find_vmts`])
//! 3. Find the signature in `.text` with a wildcard-aware Horspool search ([`scan_section`])
//! 4. Follow RIP-relative references from the match to the function ([`apply_steps`])
//! 5. Look the function up among the class's vtable slots ([`Vmt::method_index`])
//!
//! The [`Verifier`] runs a whole JSON signature document through these steps.
//!
//! ## Example
//!
//! ```no_run
//! use vmtsig::{apply_steps, find_vmts, scan_section, Pattern, PeImage, Step};
//!
//! let image = PeImage::load("client.dll")?;
//! let vmts = find_vmts(&image)?;
//!
//! let pattern = Pattern::parse("E8 ? ? ? ? 84 C0")?;
//! if let Some(hit) = scan_section(&image, ".text", &pattern) {
//!     let function = apply_steps(&image, hit, &[Step::RipRelative(1)]);
//!     let ordinal = function.and_then(|f| vmts.get("CDOTAPlayerController")?.method_index(f));
//!     println!("{ordinal:?}");
//! }
//! # Ok::<(), vmtsig::Error>(())
//! ```

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod demangle;
pub mod disasm;
pub mod error;
pub mod image;
pub mod pe;
pub mod rtti;
pub mod scanner;
pub mod signature;
pub mod steps;
pub mod verifier;

pub use builder::PeBuilder;
pub use error::{Error, Result};
pub use image::PeImage;
pub use rtti::{find_vmt, find_vmts, RttiScanner, Vmt};
pub use scanner::{scan_section, scan_section_all, Pattern};
pub use signature::{MethodSignature, Resolution, SignatureDocument, SignatureSpec};
pub use steps::{apply_steps, Step};
pub use verifier::{
    OrdinalMap, ProgressCallback, ProgressInfo, ProgressStage, Verifier, VerifyConfig,
    VerifyReport,
};
