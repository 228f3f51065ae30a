//! PE image reading and header rewriting.
//!
//! This module is the bridge between raw PE32/PE32+ bytes and the
//! [`ImageLayout`] model. Parsing is delegated to the `object` crate; the
//! write path patches the realigned fields back into the original byte
//! image at the header offsets recorded during parsing, then recomputes
//! the optional-header checksum. Nothing outside the patched fields is
//! touched, so the rest of the file round-trips byte for byte.

use std::mem;

use object::pe;
use object::read::pe::{optional_header_magic, ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;

use crate::error::{Error, Result};
use crate::layout::{ImageLayout, Section};

/// Optional-header flavor of a parsed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeKind {
    /// PE32, magic 0x10b.
    Pe32,
    /// PE32+, magic 0x20b.
    Pe32Plus,
}

/// Absolute file offsets of every header field the realignment pass may
/// rewrite, captured at parse time.
#[derive(Debug, Clone, Copy)]
struct HeaderOffsets {
    section_alignment: usize,
    file_alignment: usize,
    size_of_image: usize,
    check_sum: usize,
    section_table: usize,
}

/// A PE image held in memory, with its deserialized section layout and
/// the header offsets needed to write a mutated layout back.
pub struct PeImage {
    data: Vec<u8>,
    kind: PeKind,
    layout: ImageLayout,
    offsets: HeaderOffsets,
}

impl PeImage {
    /// Parses a PE32 or PE32+ image from a raw byte buffer.
    ///
    /// The buffer is stored inside the returned image so the header
    /// fields can later be rewritten in place.
    pub fn parse(data: Vec<u8>) -> Result<PeImage> {
        let (kind, layout, offsets) = read_image(data.as_slice())?;
        Ok(PeImage {
            data,
            kind,
            layout,
            offsets,
        })
    }

    /// The optional-header flavor of this image.
    pub fn kind(&self) -> PeKind {
        self.kind
    }

    /// The section layout as deserialized (or as last applied).
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// The current image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the image and returns its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Patches a mutated layout back into the image bytes.
    ///
    /// Writes `SectionAlignment`, `FileAlignment`, `SizeOfImage`, and the
    /// four placement fields of every section header. The layout must
    /// describe the same sections as the parsed table, in the same order
    /// and with the same names; realignment never reshapes the table.
    /// Every value is checked to fit its 32-bit header field before the
    /// first byte is written, so a failure leaves the image unchanged.
    pub fn apply_layout(&mut self, layout: &ImageLayout) -> Result<()> {
        if layout.sections.len() != self.layout.sections.len() {
            return Err(Error::Malformed(format!(
                "section count changed from {} to {}",
                self.layout.sections.len(),
                layout.sections.len()
            )));
        }
        for (old, new) in self.layout.sections.iter().zip(&layout.sections) {
            if old.name != new.name {
                return Err(Error::Malformed(format!(
                    "section {} was renamed to {}",
                    old.name_str(),
                    new.name_str()
                )));
            }
        }

        let section_alignment = narrow("SectionAlignment", layout.section_alignment)?;
        let file_alignment = narrow("FileAlignment", layout.file_alignment)?;
        let size_of_image = narrow("SizeOfImage", layout.image_size)?;
        let mut fields = Vec::with_capacity(layout.sections.len());
        for section in &layout.sections {
            fields.push(SectionFields {
                virtual_size: narrow("VirtualSize", section.virtual_size)?,
                virtual_address: narrow("VirtualAddress", section.virtual_address)?,
                size_of_raw_data: narrow("SizeOfRawData", section.file_size)?,
                pointer_to_raw_data: narrow("PointerToRawData", section.file_offset)?,
            });
        }

        write_u32(&mut self.data, self.offsets.section_alignment, section_alignment)?;
        write_u32(&mut self.data, self.offsets.file_alignment, file_alignment)?;
        write_u32(&mut self.data, self.offsets.size_of_image, size_of_image)?;
        for (index, values) in fields.iter().enumerate() {
            let base = self.offsets.section_table + index * mem::size_of::<pe::ImageSectionHeader>();
            write_u32(
                &mut self.data,
                base + mem::offset_of!(pe::ImageSectionHeader, virtual_size),
                values.virtual_size,
            )?;
            write_u32(
                &mut self.data,
                base + mem::offset_of!(pe::ImageSectionHeader, virtual_address),
                values.virtual_address,
            )?;
            write_u32(
                &mut self.data,
                base + mem::offset_of!(pe::ImageSectionHeader, size_of_raw_data),
                values.size_of_raw_data,
            )?;
            write_u32(
                &mut self.data,
                base + mem::offset_of!(pe::ImageSectionHeader, pointer_to_raw_data),
                values.pointer_to_raw_data,
            )?;
        }
        self.layout = layout.clone();
        Ok(())
    }

    /// Recomputes the optional-header `CheckSum` over the current bytes
    /// and writes it in place. Call after the last [`apply_layout`].
    ///
    /// [`apply_layout`]: PeImage::apply_layout
    pub fn update_checksum(&mut self) -> Result<()> {
        let checksum = compute_checksum(&self.data, self.offsets.check_sum);
        write_u32(&mut self.data, self.offsets.check_sum, checksum)
    }
}

struct SectionFields {
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
}

/// Deserializes just the section layout of a PE image, without taking
/// ownership of the bytes. Used to inspect written output.
pub fn peek_layout(data: &[u8]) -> Result<ImageLayout> {
    let (_, layout, _) = read_image(data)?;
    Ok(layout)
}

fn read_image(data: &[u8]) -> Result<(PeKind, ImageLayout, HeaderOffsets)> {
    match optional_header_magic(data)? {
        pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC => read_headers::<pe::ImageNtHeaders32>(data, PeKind::Pe32),
        pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC => {
            read_headers::<pe::ImageNtHeaders64>(data, PeKind::Pe32Plus)
        }
        magic => Err(Error::Malformed(format!(
            "unsupported optional header magic 0x{magic:x}"
        ))),
    }
}

fn read_headers<Pe: ImageNtHeaders>(
    data: &[u8],
    kind: PeKind,
) -> Result<(PeKind, ImageLayout, HeaderOffsets)> {
    let dos = pe::ImageDosHeader::parse(data)?;
    let mut offset = u64::from(dos.nt_headers_offset());
    // Signature (4 bytes) and COFF file header precede the optional header.
    let optional_header =
        dos.nt_headers_offset() as usize + 4 + mem::size_of::<pe::ImageFileHeader>();
    let (nt, _directories) = Pe::parse(data, &mut offset)?;
    // `parse` leaves the read offset at the start of the section table.
    let section_table = offset as usize;

    let table = nt.sections(data, offset)?;
    let mut sections = Vec::new();
    for header in table.iter() {
        sections.push(Section {
            name: header.name,
            virtual_address: u64::from(header.virtual_address.get(LE)),
            virtual_size: u64::from(header.virtual_size.get(LE)),
            file_offset: u64::from(header.pointer_to_raw_data.get(LE)),
            file_size: u64::from(header.size_of_raw_data.get(LE)),
        });
    }

    let opt = nt.optional_header();
    let layout = ImageLayout {
        section_alignment: u64::from(opt.section_alignment()),
        file_alignment: u64::from(opt.file_alignment()),
        image_size: u64::from(opt.size_of_image()),
        sections,
    };

    let offsets = match kind {
        PeKind::Pe32 => HeaderOffsets {
            section_alignment: optional_header
                + mem::offset_of!(pe::ImageOptionalHeader32, section_alignment),
            file_alignment: optional_header
                + mem::offset_of!(pe::ImageOptionalHeader32, file_alignment),
            size_of_image: optional_header + mem::offset_of!(pe::ImageOptionalHeader32, size_of_image),
            check_sum: optional_header + mem::offset_of!(pe::ImageOptionalHeader32, check_sum),
            section_table,
        },
        PeKind::Pe32Plus => HeaderOffsets {
            section_alignment: optional_header
                + mem::offset_of!(pe::ImageOptionalHeader64, section_alignment),
            file_alignment: optional_header
                + mem::offset_of!(pe::ImageOptionalHeader64, file_alignment),
            size_of_image: optional_header + mem::offset_of!(pe::ImageOptionalHeader64, size_of_image),
            check_sum: optional_header + mem::offset_of!(pe::ImageOptionalHeader64, check_sum),
            section_table,
        },
    };
    Ok((kind, layout, offsets))
}

fn narrow(field: &'static str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::FieldOverflow { field, value })
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let end = offset
        .checked_add(4)
        .ok_or_else(|| Error::Malformed(format!("header offset 0x{offset:x} overflows")))?;
    let bytes = data
        .get_mut(offset..end)
        .ok_or_else(|| Error::Malformed(format!("header write at 0x{offset:x} is out of bounds")))?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Standard PE checksum: a 16-bit word sum over the whole file with the
/// stored checksum excluded and carries folded back in, plus the file
/// length. Matches what `CheckSumMappedFile` produces.
fn compute_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        // The checksum field itself (4 bytes, two words) is excluded.
        if i >= checksum_offset && i < checksum_offset + 4 {
            i += 2;
            continue;
        }
        sum += u64::from(u16::from_le_bytes([data[i], data[i + 1]]));
        i += 2;
    }
    // Odd trailing byte, padded with zero.
    if i < data.len() && (i < checksum_offset || i >= checksum_offset + 4) {
        sum += u64::from(data[i]);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u32 + data.len() as u32
}
