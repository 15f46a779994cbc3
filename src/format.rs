//! Firmware image loading.
//!
//! AVR toolchains emit Intel HEX or ELF; raw binary and plain hex dumps are
//! accepted as well. The result is a flat image starting at the lowest
//! address present in the file.

use std::path::Path;
use std::str;

use anyhow::{bail, Result};
use object::elf::FileHeader32;
use object::read::elf::ElfFile;
use object::{Endianness, Object, ObjectSection, SectionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    IntelHex,
    Elf,
    PlainHex,
    Binary,
}

pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let raw = std::fs::read(path)?;
    let format = guess_format(path, &raw);
    log::info!("reading firmware as {:?}", format);
    match format {
        ImageFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        ImageFormat::Elf => flatten_elf(&raw),
        ImageFormat::PlainHex => {
            let digits: Vec<u8> = raw
                .into_iter()
                .filter(|&c| !c.is_ascii_whitespace())
                .collect();
            Ok(hex::decode(digits)?)
        }
        ImageFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> ImageFormat {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if ["hex", "ihex", "ihx", "eep"].contains(&ext.as_str()) {
        return ImageFormat::IntelHex;
    }
    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        ImageFormat::Elf
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c.is_ascii_whitespace())
    {
        ImageFormat::IntelHex
    } else if !raw.is_empty()
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c.is_ascii_whitespace())
    {
        ImageFormat::PlainHex
    } else {
        ImageFormat::Binary
    }
}

fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base = 0u32;
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => chunks.push((base + offset as u32, value)),
            Record::ExtendedSegmentAddress(seg) => base = (seg as u32) * 16,
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::EndOfFile
            | Record::StartSegmentAddress { .. }
            | Record::StartLinearAddress(_) => {}
        }
    }
    merge_chunks(chunks)
}

/// Flatten the allocatable sections of an ELF image, the way objcopy -O
/// binary would.
fn flatten_elf(raw: &[u8]) -> Result<Vec<u8>> {
    let elf: ElfFile<FileHeader32<Endianness>> = match ElfFile::parse(raw) {
        Ok(elf) => elf,
        Err(e) => bail!("cannot read file as 32-bit ELF: {}", e),
    };

    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    for section in elf.sections() {
        if !matches!(
            section.kind(),
            SectionKind::Text | SectionKind::Data | SectionKind::ReadOnlyData
        ) {
            continue;
        }
        let data = section.data()?;
        if data.is_empty() {
            continue;
        }
        log::debug!(
            "section {} ({:?}): {} bytes at 0x{:x}",
            section.name().unwrap_or_default(),
            section.kind(),
            data.len(),
            section.address()
        );
        chunks.push((section.address() as u32, data.to_vec()));
    }
    if chunks.is_empty() {
        bail!("no loadable sections in ELF file");
    }
    merge_chunks(chunks)
}

fn merge_chunks(mut chunks: Vec<(u32, Vec<u8>)>) -> Result<Vec<u8>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    chunks.sort_by_key(|(addr, _)| *addr);
    let start = chunks[0].0;
    let end = chunks
        .iter()
        .map(|(addr, data)| addr + data.len() as u32)
        .max()
        .unwrap();

    // Gaps stay 0xff, the erased state of AVR flash.
    let mut image = vec![0xff; (end - start) as usize];
    for (addr, data) in chunks {
        let from = (addr - start) as usize;
        image[from..from + data.len()].copy_from_slice(&data);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intel_hex_is_decoded_with_gaps_erased() {
        let hex = ":020000000102FB\n:02000400AABB95\n:00000001FF\n";
        let image = read_ihex(hex).unwrap();
        assert_eq!(image, vec![0x01, 0x02, 0xff, 0xff, 0xaa, 0xbb]);
    }

    #[test]
    fn plain_hex_ignores_whitespace() {
        let raw = b"de ad\nbe ef\n".to_vec();
        let format = guess_format(Path::new("fw.txt"), &raw);
        assert_eq!(format, ImageFormat::PlainHex);
    }

    #[test]
    fn format_guessing() {
        assert_eq!(
            guess_format(Path::new("a.hex"), b"garbage"),
            ImageFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("a.eep"), b""),
            ImageFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("a.bin"), &[0x7f, b'E', b'L', b'F', 0]),
            ImageFormat::Elf
        );
        assert_eq!(
            guess_format(Path::new("a.bin"), &[0x00, 0x01, 0x02]),
            ImageFormat::Binary
        );
        assert_eq!(
            guess_format(Path::new("a"), b":10010000214601360121470136007EFE09D2190140\n"),
            ImageFormat::IntelHex
        );
    }

    #[test]
    fn chunk_merge_orders_by_address() {
        let image = merge_chunks(vec![(4, vec![9]), (0, vec![1, 2])]).unwrap();
        assert_eq!(image, vec![1, 2, 0xff, 0xff, 9]);
    }
}
