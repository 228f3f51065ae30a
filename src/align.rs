//! Section layout realignment.
//!
//! This module contains the structural transformation at the heart of the
//! tool: given an [`ImageLayout`], it rewrites every section's placement so
//! that virtual addresses and sizes satisfy a new section alignment, file
//! offsets and sizes satisfy the image's existing file alignment, and the
//! derived image size stays consistent.

use crate::error::{Error, Result};
use crate::layout::ImageLayout;

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a non-zero power of two.
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Aligned placement of one section, computed before anything is written
/// back so the pass is all-or-nothing.
struct AlignedSection {
    virtual_address: u64,
    virtual_size: u64,
    file_offset: u64,
    file_size: u64,
}

/// Realigns every section of `layout` to `section_alignment` and updates
/// the derived image size.
///
/// Sections are packed contiguously in virtual address space: the first
/// section keeps its (rounded-up) virtual address, and each following
/// section starts at the aligned end of the previous one. Virtual sizes
/// are rounded up to `section_alignment`.
///
/// File offsets and sizes are only rounded up to the layout's unchanged
/// `file_alignment`, independently per section. The on-disk regions are
/// not repacked; if the original file was tightly packed, rounding can
/// leave the raw-data pointers overlapping or gapped. Resolving that
/// would rewrite on-disk content layout, which is beyond what a
/// realignment pass guarantees.
///
/// Section order, names, and count are preserved. Fails without touching
/// the layout if either alignment is not a non-zero power of two or the
/// section table is empty.
pub fn realign(layout: &mut ImageLayout, section_alignment: u64) -> Result<()> {
    if !is_valid_alignment(section_alignment) {
        return Err(Error::InvalidAlignment(section_alignment));
    }
    if !is_valid_alignment(layout.file_alignment) {
        return Err(Error::InvalidAlignment(layout.file_alignment));
    }
    if layout.sections.is_empty() {
        return Err(Error::EmptySections);
    }

    // First pass: pure computation, nothing mutated yet.
    let mut aligned = Vec::with_capacity(layout.sections.len());
    let mut next_address = layout.sections[0].virtual_address;
    for section in &layout.sections {
        let virtual_address = align_up(next_address, section_alignment);
        let virtual_size = align_up(section.virtual_size, section_alignment);
        next_address = virtual_address + virtual_size;
        aligned.push(AlignedSection {
            virtual_address,
            virtual_size,
            file_offset: align_up(section.file_offset, layout.file_alignment),
            file_size: align_up(section.file_size, layout.file_alignment),
        });
    }

    // Second pass: commit.
    for (section, new) in layout.sections.iter_mut().zip(&aligned) {
        section.virtual_address = new.virtual_address;
        section.virtual_size = new.virtual_size;
        section.file_offset = new.file_offset;
        section.file_size = new.file_size;
    }
    layout.section_alignment = section_alignment;
    layout.image_size = align_up(next_address, section_alignment);
    Ok(())
}

/// Checks the invariants an aligned layout must satisfy: every placement
/// field a multiple of its alignment, sections contiguous in virtual
/// address space, and the image size covering the last section's end.
///
/// Used as the post-write check on realigned images and in tests. Note
/// that file offsets are only checked for alignment, not contiguity, per
/// the rounding-only file placement above.
pub fn verify(layout: &ImageLayout) -> Result<()> {
    if !is_valid_alignment(layout.section_alignment) {
        return Err(Error::InvalidAlignment(layout.section_alignment));
    }
    if !is_valid_alignment(layout.file_alignment) {
        return Err(Error::InvalidAlignment(layout.file_alignment));
    }
    let last = layout.sections.last().ok_or(Error::EmptySections)?;

    for section in &layout.sections {
        let misaligned = [
            ("virtual address", section.virtual_address, layout.section_alignment),
            ("virtual size", section.virtual_size, layout.section_alignment),
            ("file offset", section.file_offset, layout.file_alignment),
            ("file size", section.file_size, layout.file_alignment),
        ]
        .into_iter()
        .find(|(_, value, align)| value % align != 0);
        if let Some((field, value, align)) = misaligned {
            return Err(Error::Verify(format!(
                "section {}: {} 0x{:x} is not a multiple of 0x{:x}",
                section.name_str(),
                field,
                value,
                align
            )));
        }
    }

    for pair in layout.sections.windows(2) {
        let expected = align_up(pair[0].virtual_end(), layout.section_alignment);
        if pair[1].virtual_address != expected {
            return Err(Error::Verify(format!(
                "section {} starts at 0x{:x}, expected 0x{:x} (end of {})",
                pair[1].name_str(),
                pair[1].virtual_address,
                expected,
                pair[0].name_str()
            )));
        }
    }

    if layout.image_size % layout.section_alignment != 0 || layout.image_size < last.virtual_end() {
        return Err(Error::Verify(format!(
            "image size 0x{:x} does not cover the last section end 0x{:x}",
            layout.image_size,
            last.virtual_end()
        )));
    }
    Ok(())
}

fn is_valid_alignment(align: u64) -> bool {
    align != 0 && align.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Section;

    fn named(name: &str) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        bytes
    }

    fn layout(sections: Vec<Section>) -> ImageLayout {
        ImageLayout {
            section_alignment: 0x1000,
            file_alignment: 0x200,
            image_size: 0,
            sections,
        }
    }

    fn section(name: &str, va: u64, vs: u64, fo: u64, fs: u64) -> Section {
        Section {
            name: named(name),
            virtual_address: va,
            virtual_size: vs,
            file_offset: fo,
            file_size: fs,
        }
    }

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn single_section_moves_to_alignment_boundary() {
        // One small section realigned to a 64 KiB boundary.
        let mut layout = layout(vec![section(".text", 0x1000, 0x500, 0x400, 0x500)]);
        realign(&mut layout, 0x10000).unwrap();

        let text = &layout.sections[0];
        assert_eq!(text.virtual_address, 0x10000);
        assert_eq!(text.virtual_size, 0x10000);
        assert_eq!(text.file_offset, 0x400);
        assert_eq!(text.file_size, 0x600);
        assert_eq!(layout.image_size, 0x20000);
        assert_eq!(layout.section_alignment, 0x10000);
    }

    #[test]
    fn already_aligned_sections_are_packed() {
        // Second section sits at 0x4000 with a gap; repacking pulls it
        // down to the end of the first.
        let mut layout = layout(vec![
            section(".text", 0x1000, 0x2000, 0x400, 0x200),
            section(".data", 0x4000, 0x1000, 0x600, 0x200),
        ]);
        realign(&mut layout, 0x1000).unwrap();

        assert_eq!(layout.sections[0].virtual_address, 0x1000);
        assert_eq!(layout.sections[0].virtual_size, 0x2000);
        assert_eq!(layout.sections[1].virtual_address, 0x3000);
        assert_eq!(layout.sections[1].virtual_size, 0x1000);
        assert_eq!(layout.image_size, 0x4000);
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let mut layout = layout(vec![section(".text", 0x1000, 0x500, 0x400, 0x500)]);
        let before = layout.clone();
        assert!(matches!(
            realign(&mut layout, 0x3000),
            Err(Error::InvalidAlignment(0x3000))
        ));
        assert_eq!(layout, before);
    }

    #[test]
    fn zero_alignment_is_rejected() {
        let mut layout = layout(vec![section(".text", 0x1000, 0x500, 0x400, 0x500)]);
        assert!(matches!(
            realign(&mut layout, 0),
            Err(Error::InvalidAlignment(0))
        ));
    }

    #[test]
    fn broken_file_alignment_is_rejected() {
        let mut layout = layout(vec![section(".text", 0x1000, 0x500, 0x400, 0x500)]);
        layout.file_alignment = 0x300;
        assert!(matches!(
            realign(&mut layout, 0x1000),
            Err(Error::InvalidAlignment(0x300))
        ));
    }

    #[test]
    fn empty_section_table_is_rejected() {
        let mut layout = layout(Vec::new());
        assert!(matches!(
            realign(&mut layout, 0x1000),
            Err(Error::EmptySections)
        ));
    }

    #[test]
    fn order_and_names_are_preserved() {
        let mut layout = layout(vec![
            section(".text", 0x1000, 0x200, 0x400, 0x200),
            section(".rdata", 0x2000, 0x200, 0x600, 0x200),
            section(".data", 0x3000, 0x200, 0x800, 0x200),
        ]);
        realign(&mut layout, 0x2000).unwrap();

        let names: Vec<&str> = layout.sections.iter().map(|s| s.name_str()).collect();
        assert_eq!(names, [".text", ".rdata", ".data"]);
    }

    #[test]
    fn realigned_layout_passes_verify() {
        let mut layout = layout(vec![
            section(".text", 0x1234, 0x567, 0x400, 0x123),
            section(".data", 0x4000, 0x89, 0x777, 0x45),
        ]);
        realign(&mut layout, 0x10000).unwrap();
        verify(&layout).unwrap();
    }

    #[test]
    fn realign_is_idempotent() {
        let mut layout = layout(vec![
            section(".text", 0x1000, 0x2345, 0x400, 0x250),
            section(".data", 0x9000, 0x1111, 0x700, 0x80),
        ]);
        realign(&mut layout, 0x8000).unwrap();
        let once = layout.clone();
        realign(&mut layout, 0x8000).unwrap();
        assert_eq!(layout, once);
    }

    #[test]
    fn file_offsets_are_rounded_but_not_repacked() {
        // Both sections' raw data land on file-alignment boundaries, but
        // no attempt is made to close the gap between 0x1000 and 0x5000
        // (or to resolve overlaps rounding may introduce).
        let mut layout = layout(vec![
            section(".text", 0x1000, 0x200, 0xfff, 0x100),
            section(".data", 0x2000, 0x200, 0x5000, 0x100),
        ]);
        realign(&mut layout, 0x1000).unwrap();

        assert_eq!(layout.sections[0].file_offset, 0x1000);
        assert_eq!(layout.sections[0].file_size, 0x200);
        assert_eq!(layout.sections[1].file_offset, 0x5000);
        assert_eq!(layout.sections[1].file_size, 0x200);
    }

    #[test]
    fn verify_catches_misaligned_virtual_address() {
        let mut layout = layout(vec![section(".text", 0x1000, 0x1000, 0x400, 0x200)]);
        layout.image_size = 0x2000;
        layout.sections[0].virtual_address = 0x1010;
        assert!(matches!(verify(&layout), Err(Error::Verify(_))));
    }

    #[test]
    fn verify_catches_gap_between_sections() {
        let mut layout = layout(vec![
            section(".text", 0x1000, 0x1000, 0x400, 0x200),
            section(".data", 0x5000, 0x1000, 0x600, 0x200),
        ]);
        layout.image_size = 0x6000;
        assert!(matches!(verify(&layout), Err(Error::Verify(_))));
    }

    #[test]
    fn verify_catches_short_image_size() {
        let mut layout = layout(vec![section(".text", 0x1000, 0x1000, 0x400, 0x200)]);
        layout.image_size = 0x1000;
        assert!(matches!(verify(&layout), Err(Error::Verify(_))));
    }
}
