//! MSVC RTTI and virtual method table recovery.
//!
//! MSVC places a pointer to a `CompleteObjectLocator` in the qword right before
//! every vtable. Sweeping `.rdata` for qwords that point back into `.rdata` and
//! then validating the whole chain
//!
//! ```text
//! CompleteObjectLocator ──> TypeDescriptor (type_info, decorated name)
//!          │
//!          └──> ClassHierarchyDescriptor ──> BaseClassArray[0] ──> BaseClassDescriptor
//!                                                                        │
//!                                                                        └──> TypeDescriptor
//! ```
//!
//! recovers each vtable together with its class name. All structure links on
//! x64 are image-relative RVAs and are resolved through the section table of
//! the one image being scanned.

use std::collections::BTreeMap;

use bytemuck::AnyBitPattern;
use tracing::{debug, trace};

use crate::demangle::{demangle_type, strip_type_keyword};
use crate::error::Result;
use crate::image::PeImage;
use crate::pe::Section;

/// `CompleteObjectLocator::signature` on x64 (RVA-based layout).
pub const COL_SIGNATURE_X64: u32 = 1;

/// Longest decorated name read from a type descriptor.
const MAX_TYPE_NAME: usize = 4096;

const SLOT_SIZE: usize = std::mem::size_of::<u64>();

#[repr(C)]
#[derive(AnyBitPattern, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompleteObjectLocator {
    pub signature: u32,
    /// Offset of this vtable in the complete class.
    pub offset: u32,
    /// Constructor displacement offset.
    pub cd_offset: u32,
    pub type_descriptor: u32,
    pub class_descriptor: u32,
    /// RVA of this locator.
    pub object_base: u32,
}

#[repr(C)]
#[derive(AnyBitPattern, Clone, Copy, Debug)]
pub struct ClassHierarchyDescriptor {
    pub signature: u32,
    pub attributes: u32,
    pub num_base_classes: u32,
    pub base_class_array: u32,
}

/// Pointer-to-member displacement info.
#[repr(C)]
#[derive(AnyBitPattern, Clone, Copy, Debug)]
pub struct Pmd {
    pub mdisp: i32,
    pub pdisp: i32,
    pub vdisp: i32,
}

#[repr(C)]
#[derive(AnyBitPattern, Clone, Copy, Debug)]
pub struct BaseClassDescriptor {
    pub type_descriptor: u32,
    pub num_contained_bases: u32,
    pub pmd: Pmd,
    pub attributes: u32,
}

/// Fixed part of `type_info`; the NUL-terminated decorated name follows.
#[repr(C)]
#[derive(AnyBitPattern, Clone, Copy, Debug)]
pub struct TypeDescriptor {
    pub vfptr: u64,
    /// Runtime undecorated-name cache, always zero on disk.
    pub spare: u64,
}

/// A recovered virtual method table.
///
/// Slot values are kept as `.text` RVAs, so the descriptor answers
/// [`Vmt::method_index`] on its own. It is only meaningful for the image it
/// was recovered from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vmt {
    /// Raw file offset of the first method slot.
    pub address: usize,
    /// Class name without the `class `/`struct ` keyword.
    pub name: String,
    methods: Vec<u32>,
    text: Section,
}

impl Vmt {
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Method RVAs in slot order.
    pub fn methods(&self) -> &[u32] {
        &self.methods
    }

    /// Raw file offset of slot `index`.
    pub fn slot_address(&self, index: usize) -> Option<usize> {
        (index < self.methods.len()).then(|| self.address + index * SLOT_SIZE)
    }

    /// Ordinal of the slot pointing at the function at raw offset `function`.
    pub fn method_index(&self, function: usize) -> Option<usize> {
        let rva = self.text.raw_to_rva(function)?;
        self.methods.iter().position(|&m| m == rva)
    }
}

impl std::fmt::Display for Vmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VMT at 0x{:X}: {} ({} methods)",
            self.address,
            self.name,
            self.methods.len()
        )
    }
}

/// A vtable found by the sweep, with the locator that introduced it.
#[derive(Clone, Debug)]
pub struct RecoveredVtable {
    pub locator: CompleteObjectLocator,
    pub vmt: Vmt,
}

impl RecoveredVtable {
    /// The class's own vtable rather than one emitted for a secondary base.
    pub fn is_primary(&self) -> bool {
        self.locator.offset == 0
    }
}

/// RTTI validation bound to a single image.
pub struct RttiScanner<'a> {
    image: &'a PeImage,
    rdata: &'a Section,
    text: &'a Section,
}

impl<'a> RttiScanner<'a> {
    /// Requires `.rdata` (locators, vtables) and `.text` (methods).
    pub fn new(image: &'a PeImage) -> Result<Self> {
        Ok(Self {
            image,
            rdata: image.require_section(".rdata")?,
            text: image.require_section(".text")?,
        })
    }

    /// Iterate over every vtable in `.rdata` with a valid RTTI chain.
    pub fn vtables(&self) -> Vtables<'_, 'a> {
        let range = self.rdata.raw_range();
        let len = self.image.data().len();
        Vtables {
            scanner: self,
            cursor: range.start.min(len),
            end: range.end.min(len),
        }
    }

    /// Validate the chain rooted at the locator with RVA `rva`.
    ///
    /// Returns the locator and the decoded type name.
    pub fn complete_object_locator(&self, rva: u32) -> Option<(CompleteObjectLocator, String)> {
        let raw = self.image.rva_to_raw(rva)?;
        let col: CompleteObjectLocator = self.image.read(raw).ok()?;

        if col.signature != COL_SIGNATURE_X64 {
            return None;
        }

        if col.object_base == 0 || col.type_descriptor == 0 || col.class_descriptor == 0 {
            return None;
        }

        let name = self.type_descriptor(col.type_descriptor)?;
        if !self.is_valid_hierarchy(col.class_descriptor) {
            return None;
        }

        Some((col, name))
    }

    fn is_valid_hierarchy(&self, rva: u32) -> bool {
        let Some(chd) = self.read_rva::<ClassHierarchyDescriptor>(rva) else {
            return false;
        };

        if chd.signature != 0 || chd.attributes & 0xFFFF_FFF0 != 0 || chd.num_base_classes < 1 {
            return false;
        }

        // The first array entry describes the class itself
        self.read_rva::<u32>(chd.base_class_array)
            .is_some_and(|bcd| self.is_valid_base_class(bcd))
    }

    fn is_valid_base_class(&self, rva: u32) -> bool {
        let Some(bcd) = self.read_rva::<BaseClassDescriptor>(rva) else {
            return false;
        };

        bcd.attributes & 0xFFFF_FF00 == 0 && self.type_descriptor(bcd.type_descriptor).is_some()
    }

    /// Validate a `type_info` and decode its name, e.g. `class Foo`.
    fn type_descriptor(&self, rva: u32) -> Option<String> {
        let raw = self.image.rva_to_raw(rva)?;
        let td: TypeDescriptor = self.image.read(raw).ok()?;

        // Never initialized on disk
        if td.vfptr == 0 || td.spare != 0 {
            return None;
        }

        let name = self
            .image
            .c_str(raw + std::mem::size_of::<TypeDescriptor>(), MAX_TYPE_NAME)?;
        let name = std::str::from_utf8(name).ok()?;
        demangle_type(name.strip_prefix('.')?)
    }

    fn read_rva<T: AnyBitPattern>(&self, rva: u32) -> Option<T> {
        let raw = self.image.rva_to_raw(rva)?;
        self.image.read(raw).ok()
    }

    /// RVAs of consecutive `.text` pointers starting at raw offset `first`.
    fn collect_methods(&self, first: usize, end: usize) -> Vec<u32> {
        let mut methods = Vec::new();
        let mut pos = first;

        while pos + SLOT_SIZE <= end {
            let Ok(value) = self.image.read::<u64>(pos) else {
                break;
            };
            let rva = self.image.to_rva(value);
            if !self.image.is_virtual_address(value) || !self.text.contains_rva(rva) {
                break;
            }
            methods.push(rva);
            pos += SLOT_SIZE;
        }

        methods
    }
}

/// Iterator returned by [`RttiScanner::vtables`].
pub struct Vtables<'s, 'a> {
    scanner: &'s RttiScanner<'a>,
    cursor: usize,
    end: usize,
}

impl Iterator for Vtables<'_, '_> {
    type Item = RecoveredVtable;

    fn next(&mut self) -> Option<RecoveredVtable> {
        let scanner = self.scanner;
        let image = scanner.image;

        while self.cursor + SLOT_SIZE <= self.end {
            let slot = self.cursor;
            self.cursor += SLOT_SIZE;

            let Ok(value) = image.read::<u64>(slot) else {
                break;
            };
            if !image.is_virtual_address(value) {
                continue;
            }
            let col_rva = image.to_rva(value);
            if !scanner.rdata.contains_rva(col_rva) {
                continue;
            }

            let Some((locator, decoded)) = scanner.complete_object_locator(col_rva) else {
                continue;
            };

            let first = slot + SLOT_SIZE;
            let methods = scanner.collect_methods(first, self.end);

            // The slots belong to this vtable; never re-read them as candidates
            self.cursor += methods.len() * SLOT_SIZE;

            let vmt = Vmt {
                address: first,
                name: strip_type_keyword(&decoded).to_string(),
                methods,
                text: scanner.text.clone(),
            };
            trace!(
                name = %vmt.name,
                address = vmt.address,
                methods = vmt.method_count(),
                offset = locator.offset,
                "recovered vtable"
            );

            return Some(RecoveredVtable { locator, vmt });
        }

        None
    }
}

/// Recover every primary vtable in the image, keyed by class name.
///
/// Secondary vtables (non-zero offset in the complete class) are walked so the
/// sweep skips their slots, but are not returned.
pub fn find_vmts(image: &PeImage) -> Result<BTreeMap<String, Vmt>> {
    let scanner = RttiScanner::new(image)?;

    let mut vmts = BTreeMap::new();
    let mut secondary = 0usize;
    for found in scanner.vtables() {
        if found.is_primary() {
            vmts.insert(found.vmt.name.clone(), found.vmt);
        } else {
            secondary += 1;
        }
    }

    debug!(primary = vmts.len(), secondary, "vtable sweep complete");
    Ok(vmts)
}

/// Find the first vtable (primary or not) whose class name is `name`.
pub fn find_vmt(image: &PeImage, name: &str) -> Result<Option<Vmt>> {
    let scanner = RttiScanner::new(image)?;
    let found = scanner
        .vtables()
        .find(|found| found.vmt.name == name)
        .map(|found| found.vmt);
    Ok(found)
}
