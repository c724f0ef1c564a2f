//! Disassembly preview of resolved addresses.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

use crate::image::PeImage;

/// One decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisasmLine {
    /// Virtual address the instruction has once the image is mapped.
    pub address: u64,
    pub bytes: Vec<u8>,
    /// Intel syntax.
    pub text: String,
}

impl std::fmt::Display for DisasmLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes: Vec<String> = self.bytes.iter().map(|b| format!("{b:02X}")).collect();
        write!(f, "0x{:016X}  {:<30} {}", self.address, bytes.join(" "), self.text)
    }
}

/// Decode up to `count` instructions at raw file offset `raw`.
///
/// Decoding stops early at the end of the containing section or at the first
/// invalid instruction. Returns nothing if `raw` is not inside a section.
pub fn preview(image: &PeImage, raw: usize, count: usize) -> Vec<DisasmLine> {
    let Some(section) = image.sections().iter().find(|s| s.contains_raw(raw)) else {
        return Vec::new();
    };
    let Some(rva) = section.raw_to_rva(raw) else {
        return Vec::new();
    };

    let end = section.raw_range().end.min(image.data().len());
    let Some(code) = image.data().get(raw..end) else {
        return Vec::new();
    };
    let ip = image.image_base().wrapping_add(rva as u64);

    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instruction = Instruction::default();
    let mut lines = Vec::with_capacity(count);

    while lines.len() < count && decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            break;
        }

        let start = instruction.ip().wrapping_sub(ip) as usize;
        let mut text = String::new();
        formatter.format(&instruction, &mut text);

        lines.push(DisasmLine {
            address: instruction.ip(),
            bytes: code[start..start + instruction.len()].to_vec(),
            text,
        });
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PeBuilder;
    use crate::pe::{CODE_SECTION_CHARACTERISTICS, DATA_SECTION_CHARACTERISTICS};

    const BASE: u64 = 0x1_8000_0000;

    fn image() -> (PeImage, usize) {
        let mut b = PeBuilder::new(BASE);
        let text = b.add_section(".text", CODE_SECTION_CHARACTERISTICS, 0x100);
        b.add_section(".data", DATA_SECTION_CHARACTERISTICS, 0x100);
        // push rbp; mov rbp,rsp; ret; then an invalid opcode in 64-bit mode
        b.write(text + 0x10, &[0x55, 0x48, 0x8B, 0xEC, 0xC3, 0x06]).unwrap();
        let image = PeImage::from_bytes(b.build()).unwrap();
        let raw = image.rva_to_raw(text).unwrap();
        (image, raw)
    }

    #[test]
    fn test_preview() {
        let (image, text) = image();
        let lines = preview(&image, text + 0x10, 8);

        // Stops at the invalid opcode
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "push rbp");
        assert_eq!(lines[0].address, BASE + 0x1010);
        assert_eq!(lines[1].bytes, vec![0x48, 0x8B, 0xEC]);
        assert!(lines[1].text.starts_with("mov rbp,"));
        assert_eq!(lines[2].text, "ret");
        assert_eq!(lines[2].address, BASE + 0x1014);
    }

    #[test]
    fn test_preview_count() {
        let (image, text) = image();
        assert_eq!(preview(&image, text + 0x10, 1).len(), 1);
        assert!(preview(&image, text + 0x10, 0).is_empty());
    }

    #[test]
    fn test_preview_outside_sections() {
        let (image, _) = image();
        assert!(preview(&image, 0, 4).is_empty());
        assert!(preview(&image, usize::MAX, 4).is_empty());
    }

    #[test]
    fn test_display() {
        let line = DisasmLine {
            address: 0x1_8000_1000,
            bytes: vec![0xC3],
            text: "ret".to_string(),
        };
        assert!(line.to_string().starts_with("0x0000000180001000  C3"));
        assert!(line.to_string().ends_with(" ret"));
    }
}
