//! On-disk PE image loading.
//!
//! A [`PeImage`] owns the complete file contents and the parsed headers. Every
//! offset handed out by this crate is a *raw file offset* into that buffer, not
//! an address in a mapped module; VA/RVA conversions go through the section
//! table.

use std::path::Path;

use bytemuck::AnyBitPattern;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pe::{
    encode_section_name, DosHeader, FileHeader, OptionalHeader64, Section, SectionHeader,
    DOS_MAGIC, MACHINE_AMD64, OPTIONAL_HDR64_MAGIC, PE_SIGNATURE,
};

/// A PE32+ image read fully into memory. Immutable after construction.
#[derive(Debug)]
pub struct PeImage {
    data: Vec<u8>,
    dos_header: DosHeader,
    file_header: FileHeader,
    optional_header: OptionalHeader64,
    sections: Vec<Section>,
}

impl PeImage {
    /// Read `path` into memory and parse its headers.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| Error::from_read(path, e))?;

        let image = Self::from_bytes(data)?;
        debug!(
            path = %path.display(),
            size = image.data.len(),
            sections = image.sections.len(),
            "loaded image"
        );
        Ok(image)
    }

    /// Parse an image from a buffer that already holds the whole file.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let dos_size = std::mem::size_of::<DosHeader>();
        if data.len() < dos_size {
            return Err(Error::HeadersTooSmall {
                expected: dos_size,
                actual: data.len(),
            });
        }

        let dos_header: DosHeader = read_at(&data, 0)?;
        if dos_header.e_magic != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(0));
        }

        let pe_offset = usize::try_from(dos_header.e_lfanew)
            .map_err(|_| Error::InvalidPeSignature(0))?;

        // PE signature + file header + the fixed part of the optional header
        let min_pe_size = pe_offset
            + 4
            + std::mem::size_of::<FileHeader>()
            + std::mem::size_of::<OptionalHeader64>();
        if data.len() < min_pe_size {
            return Err(Error::HeadersTooSmall {
                expected: min_pe_size,
                actual: data.len(),
            });
        }

        let signature: u32 = read_at(&data, pe_offset)?;
        if signature != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(pe_offset));
        }

        let file_header: FileHeader = read_at(&data, pe_offset + 4)?;
        if file_header.machine != MACHINE_AMD64 {
            return Err(Error::UnsupportedMachine(file_header.machine));
        }

        let opt_header_start = pe_offset + 4 + std::mem::size_of::<FileHeader>();
        let optional_header: OptionalHeader64 = read_at(&data, opt_header_start)?;
        if optional_header.magic != OPTIONAL_HDR64_MAGIC {
            return Err(Error::UnsupportedOptionalHeader(optional_header.magic));
        }

        let section_header_start = opt_header_start + file_header.size_of_optional_header as usize;
        let header_size = std::mem::size_of::<SectionHeader>();
        let sections = (0..file_header.number_of_sections as usize)
            .map(|i| {
                read_at::<SectionHeader>(&data, section_header_start + i * header_size)
                    .map(|header| Section::from(&header))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            data,
            dos_header,
            file_header,
            optional_header,
            sections,
        })
    }

    /// The whole file.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn dos_header(&self) -> &DosHeader {
        &self.dos_header
    }

    pub fn file_header(&self) -> &FileHeader {
        &self.file_header
    }

    pub fn optional_header(&self) -> &OptionalHeader64 {
        &self.optional_header
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Preferred load address from the optional header.
    pub fn image_base(&self) -> u64 {
        self.optional_header.image_base
    }

    /// `SizeOfImage` from the optional header.
    pub fn size_of_image(&self) -> u32 {
        self.optional_header.size_of_image
    }

    /// Find a section by exact 8-byte name match.
    ///
    /// Names longer than 8 bytes cannot be stored in a section header and
    /// never match.
    pub fn section(&self, name: &str) -> Option<&Section> {
        if name.len() > 8 {
            return None;
        }
        let raw_name = encode_section_name(name);
        self.sections.iter().find(|s| s.raw_name == raw_name)
    }

    /// Like [`PeImage::section`], but a missing section is an error.
    pub fn require_section(&self, name: &str) -> Result<&Section> {
        self.section(name).ok_or_else(|| Error::SectionNotFound {
            name: name.to_string(),
        })
    }

    /// Convert a virtual address as stored in the file into an RVA.
    ///
    /// Only meaningful when [`PeImage::is_virtual_address`] holds.
    #[inline]
    pub fn to_rva(&self, va: u64) -> u32 {
        va.wrapping_sub(self.image_base()) as u32
    }

    /// `ImageBase < va < ImageBase + SizeOfImage`.
    #[inline]
    pub fn is_virtual_address(&self, va: u64) -> bool {
        let base = self.image_base();
        va > base && va - base < self.size_of_image() as u64
    }

    /// Whether `raw` lies within `[0, SizeOfImage]`.
    #[inline]
    pub fn is_in_bounds(&self, raw: usize) -> bool {
        raw <= self.size_of_image() as usize
    }

    /// Translate an RVA to a raw offset via the first section containing it.
    pub fn rva_to_raw(&self, rva: u32) -> Option<usize> {
        self.sections.iter().find_map(|s| s.rva_to_raw(rva))
    }

    /// Translate a raw offset to an RVA via the section holding it.
    pub fn raw_to_rva(&self, raw: usize) -> Option<u32> {
        self.sections.iter().find_map(|s| s.raw_to_rva(raw))
    }

    /// Read a `T` at raw offset `offset`, checking it fits in the buffer.
    #[inline]
    pub fn read<T: AnyBitPattern>(&self, offset: usize) -> Result<T> {
        read_at(&self.data, offset)
    }

    /// Borrow `len` bytes at raw offset `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds {
            offset,
            size: len,
            len: self.data.len(),
        })?;
        self.data.get(offset..end).ok_or(Error::OutOfBounds {
            offset,
            size: len,
            len: self.data.len(),
        })
    }

    /// Raw bytes of a section, clipped to the end of the file.
    pub fn section_data(&self, section: &Section) -> &[u8] {
        let range = section.raw_range();
        let start = range.start.min(self.data.len());
        let end = range.end.min(self.data.len());
        &self.data[start..end]
    }

    /// Read a NUL-terminated byte string of at most `max_len` bytes.
    ///
    /// Returns `None` if no terminator is found within the limit or the buffer.
    pub fn c_str(&self, offset: usize, max_len: usize) -> Option<&[u8]> {
        let tail = self.data.get(offset..)?;
        let limit = tail.len().min(max_len);
        let end = tail[..limit].iter().position(|&b| b == 0)?;
        Some(&tail[..end])
    }
}

/// Bounds-checked unaligned read of a plain-data structure.
fn read_at<T: AnyBitPattern>(data: &[u8], offset: usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let bytes = offset
        .checked_add(size)
        .and_then(|end| data.get(offset..end))
        .ok_or(Error::OutOfBounds {
            offset,
            size,
            len: data.len(),
        })?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}
