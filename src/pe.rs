//! PE format types.
//!
//! On-disk header layouts for PE32+ images and the per-section bookkeeping used
//! to translate between RVAs and raw file offsets. The structures are plain
//! `repr(C)` records so they can be read out of a byte buffer with `bytemuck`
//! after a bounds check.

use bytemuck::{AnyBitPattern, NoUninit};

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const MACHINE_AMD64: u16 = 0x8664;
pub const OPTIONAL_HDR64_MAGIC: u16 = 0x020B;
pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = 16;

// File characteristics
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
pub const IMAGE_FILE_DLL: u16 = 0x2000;

// Section characteristics
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Characteristics of a typical `.text` section.
pub const CODE_SECTION_CHARACTERISTICS: u32 =
    IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;

/// Characteristics of a typical `.rdata` section.
pub const RDATA_SECTION_CHARACTERISTICS: u32 = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;

/// Characteristics of a typical `.data` section.
pub const DATA_SECTION_CHARACTERISTICS: u32 =
    IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;

/// DOS header (64 bytes).
#[repr(C)]
#[derive(AnyBitPattern, NoUninit, Clone, Copy, Debug)]
pub struct DosHeader {
    pub e_magic: u16,      // Magic number ("MZ")
    pub e_cblp: u16,       // Bytes on last page of file
    pub e_cp: u16,         // Pages in file
    pub e_crlc: u16,       // Relocations
    pub e_cparhdr: u16,    // Size of header in paragraphs
    pub e_minalloc: u16,   // Minimum extra paragraphs needed
    pub e_maxalloc: u16,   // Maximum extra paragraphs needed
    pub e_ss: u16,         // Initial SS value
    pub e_sp: u16,         // Initial SP value
    pub e_csum: u16,       // Checksum
    pub e_ip: u16,         // Initial IP value
    pub e_cs: u16,         // Initial CS value
    pub e_lfarlc: u16,     // File address of relocation table
    pub e_ovno: u16,       // Overlay number
    pub e_res: [u16; 4],   // Reserved words
    pub e_oemid: u16,      // OEM identifier
    pub e_oeminfo: u16,    // OEM information
    pub e_res2: [u16; 10], // Reserved words
    pub e_lfanew: i32,     // File address of new exe header (PE offset)
}

impl DosHeader {
    /// Create a minimal valid DOS header.
    pub fn minimal(pe_offset: u32) -> Self {
        Self {
            e_magic: DOS_MAGIC,
            e_cblp: 0x90,
            e_cp: 0x03,
            e_crlc: 0,
            e_cparhdr: 0x04,
            e_minalloc: 0,
            e_maxalloc: 0xFFFF,
            e_ss: 0,
            e_sp: 0xB8,
            e_csum: 0,
            e_ip: 0,
            e_cs: 0,
            e_lfarlc: 0x40,
            e_ovno: 0,
            e_res: [0; 4],
            e_oemid: 0,
            e_oeminfo: 0,
            e_res2: [0; 10],
            e_lfanew: pe_offset as i32,
        }
    }

    /// Standard DOS stub program.
    pub const DOS_STUB: &'static [u8] = b"\x0E\x1F\xBA\x0E\x00\xB4\x09\xCD\x21\xB8\x01\x4C\xCD\x21This program cannot be run in DOS mode.\r\r\n$";
}

/// COFF file header (20 bytes).
#[repr(C)]
#[derive(AnyBitPattern, NoUninit, Clone, Copy, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Data directory entry.
#[repr(C)]
#[derive(AnyBitPattern, NoUninit, Clone, Copy, Debug, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Optional header (PE32+, 64-bit), without the trailing data directories.
#[repr(C)]
#[derive(AnyBitPattern, NoUninit, Clone, Copy, Debug)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// Section header (40 bytes).
#[repr(C)]
#[derive(AnyBitPattern, NoUninit, Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Get the section name as a string (trimmed of null bytes).
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Create a new section header with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: encode_section_name(name),
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: 0,
        }
    }
}

/// Pad (or truncate) a section name to the 8-byte on-disk form.
pub fn encode_section_name(name: &str) -> [u8; 8] {
    let mut raw = [0u8; 8];
    let bytes = name.as_bytes();
    let len = bytes.len().min(8);
    raw[..len].copy_from_slice(&bytes[..len]);
    raw
}

/// Align a value up to the given alignment (a power of two).
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// A parsed section: its virtual range and where its bytes live in the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Exact 8-byte on-disk name, used for lookups.
    pub raw_name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl From<&SectionHeader> for Section {
    fn from(header: &SectionHeader) -> Self {
        Self {
            name: header.name_str().to_string(),
            raw_name: header.name,
            virtual_size: header.virtual_size,
            virtual_address: header.virtual_address,
            size_of_raw_data: header.size_of_raw_data,
            pointer_to_raw_data: header.pointer_to_raw_data,
            characteristics: header.characteristics,
        }
    }
}

impl Section {
    /// Whether `rva` lies inside `[VirtualAddress, VirtualAddress + VirtualSize)`.
    #[inline]
    pub fn contains_rva(&self, rva: u32) -> bool {
        let start = self.virtual_address as u64;
        let rva = rva as u64;
        rva >= start && rva < start + self.virtual_size as u64
    }

    /// Whether the raw file offset lies inside this section's raw data.
    #[inline]
    pub fn contains_raw(&self, raw: usize) -> bool {
        let start = self.pointer_to_raw_data as usize;
        raw >= start && raw < start + self.size_of_raw_data as usize
    }

    /// Translate an RVA into a raw file offset.
    ///
    /// Returns `None` when the RVA is outside the section or falls in the
    /// zero-filled tail that has no bytes on disk.
    #[inline]
    pub fn rva_to_raw(&self, rva: u32) -> Option<usize> {
        if !self.contains_rva(rva) {
            return None;
        }
        let delta = rva - self.virtual_address;
        if delta >= self.size_of_raw_data {
            return None;
        }
        Some(self.pointer_to_raw_data as usize + delta as usize)
    }

    /// Translate a raw file offset back into an RVA.
    ///
    /// Returns `None` if the RVA would not fit in 32 bits.
    #[inline]
    pub fn raw_to_rva(&self, raw: usize) -> Option<u32> {
        if !self.contains_raw(raw) {
            return None;
        }
        let delta = u32::try_from(raw - self.pointer_to_raw_data as usize).ok()?;
        self.virtual_address.checked_add(delta)
    }

    /// Raw file range covered by the section.
    pub fn raw_range(&self) -> std::ops::Range<usize> {
        let start = self.pointer_to_raw_data as usize;
        start..start + self.size_of_raw_data as usize
    }
}
