//! Minimal PE32+ image writer.
//!
//! Lays out a DOS header and stub, NT headers, a section table and file-aligned
//! section data. Sections are placed at consecutive section-aligned RVAs
//! starting at `0x1000`, so the RVA returned by [`PeBuilder::add_section`] is
//! final and can be used to encode cross-section pointers before the image is
//! built.

use bytemuck::bytes_of;

use crate::error::{Error, Result};
use crate::pe::{
    align_up, DataDirectory, DosHeader, FileHeader, OptionalHeader64, SectionHeader,
    IMAGE_FILE_DLL, IMAGE_FILE_EXECUTABLE_IMAGE, IMAGE_FILE_LARGE_ADDRESS_AWARE, IMAGE_SCN_CNT_CODE,
    MACHINE_AMD64, NUMBER_OF_DIRECTORY_ENTRIES, OPTIONAL_HDR64_MAGIC, PE_SIGNATURE,
};

const PE_OFFSET: u32 = 0x80;
const FIRST_SECTION_RVA: u32 = 0x1000;

struct PendingSection {
    name: String,
    characteristics: u32,
    virtual_address: u32,
    data: Vec<u8>,
}

/// Builder for small, well-formed PE32+ DLL images.
pub struct PeBuilder {
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    sections: Vec<PendingSection>,
}

impl PeBuilder {
    pub fn new(image_base: u64) -> Self {
        Self {
            image_base,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            sections: Vec::new(),
        }
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// VA of `rva` under the builder's image base.
    pub fn va(&self, rva: u32) -> u64 {
        self.image_base.wrapping_add(rva as u64)
    }

    /// Append a zero-filled section of `size` bytes and return its RVA.
    pub fn add_section(&mut self, name: &str, characteristics: u32, size: usize) -> u32 {
        let virtual_address = match self.sections.last() {
            Some(prev) => align_up(
                prev.virtual_address as usize + prev.data.len().max(1),
                self.section_alignment as usize,
            ) as u32,
            None => FIRST_SECTION_RVA,
        };

        self.sections.push(PendingSection {
            name: name.to_string(),
            characteristics,
            virtual_address,
            data: vec![0; size],
        });
        virtual_address
    }

    /// Copy `bytes` into whichever section covers `rva`.
    pub fn write(&mut self, rva: u32, bytes: &[u8]) -> Result<()> {
        let section = self
            .sections
            .iter_mut()
            .find(|s| rva >= s.virtual_address && rva < s.virtual_address + s.data.len() as u32)
            .ok_or(Error::OutOfBounds {
                offset: rva as usize,
                size: bytes.len(),
                len: 0,
            })?;

        let start = (rva - section.virtual_address) as usize;
        let len = section.data.len();
        let dest = section
            .data
            .get_mut(start..start + bytes.len())
            .ok_or(Error::OutOfBounds {
                offset: rva as usize,
                size: bytes.len(),
                len,
            })?;
        dest.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(&mut self, rva: u32, value: u32) -> Result<()> {
        self.write(rva, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, rva: u32, value: u64) -> Result<()> {
        self.write(rva, &value.to_le_bytes())
    }

    /// Store the absolute VA of `target_rva` at `rva`, as a relocated pointer would be.
    pub fn write_va(&mut self, rva: u32, target_rva: u32) -> Result<()> {
        let va = self.va(target_rva);
        self.write_u64(rva, va)
    }

    /// Serialize the image.
    pub fn build(&self) -> Vec<u8> {
        let optional_header_size = std::mem::size_of::<OptionalHeader64>()
            + NUMBER_OF_DIRECTORY_ENTRIES * std::mem::size_of::<DataDirectory>();
        let headers_size = PE_OFFSET as usize
            + 4
            + std::mem::size_of::<FileHeader>()
            + optional_header_size
            + self.sections.len() * std::mem::size_of::<SectionHeader>();
        let size_of_headers = align_up(headers_size, self.file_alignment as usize);

        // Section table and raw placement
        let mut headers = Vec::with_capacity(self.sections.len());
        let mut raw_offset = size_of_headers;
        for section in &self.sections {
            let raw_size = align_up(section.data.len(), self.file_alignment as usize);
            let mut header = SectionHeader::new(&section.name);
            header.virtual_size = section.data.len() as u32;
            header.virtual_address = section.virtual_address;
            header.size_of_raw_data = raw_size as u32;
            header.pointer_to_raw_data = if raw_size == 0 { 0 } else { raw_offset as u32 };
            header.characteristics = section.characteristics;
            raw_offset += raw_size;
            headers.push(header);
        }

        let size_of_image = self
            .sections
            .last()
            .map(|s| s.virtual_address as usize + s.data.len().max(1))
            .unwrap_or(size_of_headers);
        let size_of_image = align_up(size_of_image, self.section_alignment as usize) as u32;

        let size_of_code = self
            .sections
            .iter()
            .filter(|s| s.characteristics & IMAGE_SCN_CNT_CODE != 0)
            .map(|s| align_up(s.data.len(), self.file_alignment as usize) as u32)
            .sum();

        let file_header = FileHeader {
            machine: MACHINE_AMD64,
            number_of_sections: self.sections.len() as u16,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: optional_header_size as u16,
            characteristics: IMAGE_FILE_EXECUTABLE_IMAGE
                | IMAGE_FILE_LARGE_ADDRESS_AWARE
                | IMAGE_FILE_DLL,
        };

        let optional_header = OptionalHeader64 {
            magic: OPTIONAL_HDR64_MAGIC,
            major_linker_version: 14,
            minor_linker_version: 0,
            size_of_code,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0,
            base_of_code: FIRST_SECTION_RVA,
            image_base: self.image_base,
            section_alignment: self.section_alignment,
            file_alignment: self.file_alignment,
            major_operating_system_version: 6,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image,
            size_of_headers: size_of_headers as u32,
            check_sum: 0,
            subsystem: 2, // Windows GUI
            dll_characteristics: 0,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: NUMBER_OF_DIRECTORY_ENTRIES as u32,
        };

        let mut output = vec![0u8; raw_offset];

        let dos_header = DosHeader::minimal(PE_OFFSET);
        output[..64].copy_from_slice(bytes_of(&dos_header));
        output[64..64 + DosHeader::DOS_STUB.len()].copy_from_slice(DosHeader::DOS_STUB);

        let mut pos = PE_OFFSET as usize;
        let mut put = |bytes: &[u8]| {
            output[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };

        put(&PE_SIGNATURE.to_le_bytes());
        put(bytes_of(&file_header));
        put(bytes_of(&optional_header));
        for _ in 0..NUMBER_OF_DIRECTORY_ENTRIES {
            put(bytes_of(&DataDirectory::default()));
        }
        for header in &headers {
            put(bytes_of(header));
        }

        for (section, header) in self.sections.iter().zip(&headers) {
            let start = header.pointer_to_raw_data as usize;
            output[start..start + section.data.len()].copy_from_slice(&section.data);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::{CODE_SECTION_CHARACTERISTICS, RDATA_SECTION_CHARACTERISTICS};

    #[test]
    fn test_section_rvas_are_sequential() {
        let mut builder = PeBuilder::new(0x1_8000_0000);
        assert_eq!(builder.add_section(".text", CODE_SECTION_CHARACTERISTICS, 0x10), 0x1000);
        assert_eq!(builder.add_section(".rdata", RDATA_SECTION_CHARACTERISTICS, 0x1800), 0x2000);
        assert_eq!(builder.add_section(".data", RDATA_SECTION_CHARACTERISTICS, 0x10), 0x4000);
        assert_eq!(builder.va(0x2000), 0x1_8000_2000);
    }

    #[test]
    fn test_write_outside_sections_fails() {
        let mut builder = PeBuilder::new(0x1_8000_0000);
        let text = builder.add_section(".text", CODE_SECTION_CHARACTERISTICS, 0x10);
        assert!(builder.write(text, &[0x90; 0x10]).is_ok());
        assert!(builder.write(text + 0x0C, &[0x90; 8]).is_err());
        assert!(builder.write(0x500, &[0x90]).is_err());
    }

    #[test]
    fn test_layout_is_file_aligned() {
        let mut builder = PeBuilder::new(0x1_8000_0000);
        builder.add_section(".text", CODE_SECTION_CHARACTERISTICS, 0x10);
        builder.add_section(".rdata", RDATA_SECTION_CHARACTERISTICS, 0x210);
        let bytes = builder.build();
        // headers (0x200) + .text (0x200) + .rdata (0x400)
        assert_eq!(bytes.len(), 0x800);
        assert_eq!(&bytes[..2], b"MZ");
        assert_eq!(&bytes[0x80..0x84], b"PE\0\0");
    }
}
