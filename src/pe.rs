//! PE image mapping for offline scans.
//!
//! A PE file on disk is laid out by file offsets; the code it contains
//! addresses itself by virtual address. [`MappedImage`] copies the headers
//! and every section to their virtual offsets so the image can be scanned
//! exactly as the loader would present it, then copies patched sections back
//! into the file layout.

use crate::error::{Error, Result};
use crate::memory::ImageView;

use tracing::debug;

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const MACHINE_AMD64: u16 = 0x8664;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20B;

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;

const DOS_LFANEW: usize = 0x3C;
const FILE_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
/// Optional header bytes read, through `SizeOfHeaders`.
const OPTIONAL_HEADER_MIN: usize = 64;

/// One section header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
    pub characteristics: u32,
}

impl Section {
    pub fn is_code(&self) -> bool {
        self.characteristics & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE) != 0
    }

    /// Bytes backed by file data at both ends of the mapping.
    fn mapped_len(&self) -> usize {
        if self.virtual_size == 0 {
            self.size_of_raw_data as usize
        } else {
            self.virtual_size.min(self.size_of_raw_data) as usize
        }
    }

    fn file_range(&self) -> std::ops::Range<usize> {
        let start = self.pointer_to_raw_data as usize;
        start..start + self.mapped_len()
    }

    fn image_range(&self) -> std::ops::Range<usize> {
        let start = self.virtual_address as usize;
        start..start + self.mapped_len()
    }
}

/// Headers of a 64-bit PE file.
#[derive(Clone, Debug)]
pub struct PeHeaders {
    pub image_base: u64,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub sections: Vec<Section>,
}

impl PeHeaders {
    /// Parse the headers at the start of `file`.
    pub fn parse(file: &[u8]) -> Result<Self> {
        if read_u16(file, 0)? != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(0));
        }

        let pe_offset = read_u32(file, DOS_LFANEW)? as usize;
        if read_u32(file, pe_offset)? != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(pe_offset));
        }

        let file_header = pe_offset + 4;
        let machine = read_u16(file, file_header)?;
        if machine != MACHINE_AMD64 {
            return Err(Error::UnsupportedMachine(machine));
        }
        let number_of_sections = read_u16(file, file_header + 2)? as usize;
        let size_of_optional_header = read_u16(file, file_header + 16)? as usize;

        let optional = file_header + FILE_HEADER_SIZE;
        if size_of_optional_header < OPTIONAL_HEADER_MIN {
            return Err(Error::HeadersTooSmall {
                expected: OPTIONAL_HEADER_MIN,
                actual: size_of_optional_header,
            });
        }
        if read_u16(file, optional)? != OPTIONAL_MAGIC_PE32_PLUS {
            return Err(Error::Unsupported("PE32 optional header"));
        }

        let section_table = optional + size_of_optional_header;
        let sections = (0..number_of_sections)
            .map(|i| read_section(file, section_table + i * SECTION_HEADER_SIZE))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            image_base: read_u64(file, optional + 24)?,
            size_of_image: read_u32(file, optional + 56)?,
            size_of_headers: read_u32(file, optional + 60)?,
            sections,
        })
    }
}

/// A PE file copied into its virtual layout.
pub struct MappedImage {
    headers: PeHeaders,
    bytes: Vec<u8>,
}

impl MappedImage {
    /// Map `file` the way the loader would, without relocating it.
    pub fn map(file: &[u8]) -> Result<Self> {
        let headers = PeHeaders::parse(file)?;
        let mut bytes = vec![0u8; headers.size_of_image as usize];

        let header_len = (headers.size_of_headers as usize)
            .min(file.len())
            .min(bytes.len());
        bytes[..header_len].copy_from_slice(&file[..header_len]);

        for section in &headers.sections {
            let out_of_bounds = || Error::SectionOutOfBounds {
                name: section.name.clone(),
            };
            let src = file.get(section.file_range()).ok_or_else(out_of_bounds)?;
            let dst = bytes
                .get_mut(section.image_range())
                .ok_or_else(out_of_bounds)?;
            dst.copy_from_slice(src);
        }

        debug!(
            "mapped {} sections, image base 0x{:X}, size 0x{:X}",
            headers.sections.len(),
            headers.image_base,
            bytes.len()
        );
        Ok(Self { headers, bytes })
    }

    pub fn image_base(&self) -> u64 {
        self.headers.image_base
    }

    pub fn headers(&self) -> &PeHeaders {
        &self.headers
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView::new(self.headers.image_base, &self.bytes)
    }

    /// Copy every section back to its file offset in `file`.
    ///
    /// Returns the number of file bytes that changed.
    pub fn write_back(&self, file: &mut [u8]) -> Result<usize> {
        let mut changed = 0;

        for section in &self.headers.sections {
            let out_of_bounds = || Error::SectionOutOfBounds {
                name: section.name.clone(),
            };
            let src = self
                .bytes
                .get(section.image_range())
                .ok_or_else(out_of_bounds)?;
            let dst = file.get_mut(section.file_range()).ok_or_else(out_of_bounds)?;

            changed += src.iter().zip(dst.iter()).filter(|(a, b)| a != b).count();
            dst.copy_from_slice(src);
        }

        Ok(changed)
    }
}

fn read_bytes<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    offset
        .checked_add(N)
        .and_then(|end| buf.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(Error::HeadersTooSmall {
            expected: offset.saturating_add(N),
            actual: buf.len(),
        })
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    read_bytes(buf, offset).map(u16::from_le_bytes)
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    read_bytes(buf, offset).map(u32::from_le_bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    read_bytes(buf, offset).map(u64::from_le_bytes)
}

fn read_section(file: &[u8], offset: usize) -> Result<Section> {
    let raw_name: [u8; 8] = read_bytes(file, offset)?;
    let end = raw_name.iter().position(|&b| b == 0).unwrap_or(8);

    Ok(Section {
        name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
        virtual_size: read_u32(file, offset + 8)?,
        virtual_address: read_u32(file, offset + 12)?,
        size_of_raw_data: read_u32(file, offset + 16)?,
        pointer_to_raw_data: read_u32(file, offset + 20)?,
        characteristics: read_u32(file, offset + 36)?,
    })
}
