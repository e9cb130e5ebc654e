//! PSI (Program-Specific Information) section assembly, validation and generation.
//!
//! This module implements the section-assembly protocol of spec.md §4.1, shared by every
//! table-specific decoder/generator pair (`pat`, `pmt`, `nit`, `sdt`, `eit`, `tdt`, `cat`,
//! `scte35`).

pub mod cat;
pub mod descriptors;
pub mod eit;
pub mod nit;
pub mod pat;
pub mod pmt;
pub mod scte35;
pub mod sdt;
pub mod tdt;

pub use descriptors::Descriptor;

use crate::error::{MuxError, MuxResult, WireErrorKind, WireResult};
use crate::slice_reader::SliceReader;
use crate::{read_bitfield, write_bitfield};
use bytes::Bytes;
use crc::{Crc, CRC_32_MPEG_2};
use modular_bitfield_msb::prelude::*;

/// Maximum number of sections in one PSI table (`section_number` is 8 bits).
pub const PSI_TABLE_MAX_SECTIONS: usize = 256;

/// Maximum size of a standard PSI section (spec.md §6).
pub const PSI_MAX_SIZE: usize = 1024;

/// Maximum size of a private PSI section (spec.md §6).
pub const PSI_PRIVATE_MAX_SIZE: usize = 4096;

/// Fixed PID assignments shared by every conformance (spec.md §3 invariants).
pub mod fixed_pid {
    /// Program Association Table.
    pub const PAT: u16 = 0;
    /// Conditional Access Table.
    pub const CAT: u16 = 1;
    /// Network Information Table (DVB).
    pub const NIT: u16 = 16;
    /// Service Description Table (DVB).
    pub const SDT: u16 = 17;
    /// Event Information Table (DVB).
    pub const EIT: u16 = 18;
    /// Time and Date Table (DVB).
    pub const TDT: u16 = 20;
    /// First PID considered for automatic allocation.
    pub const FIRST_AUTO: u16 = 256;
}

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Computes the CRC-32/MPEG-2 checksum used to protect every PSI section.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// 3-byte header common to every PSI section.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    #[skip]
    pub unused_bits: B2,
    pub section_length: B10,
}

/// 5-byte extended syntax section, present whenever `section_syntax_indicator` is set.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PsiTableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

/// One parsed-and-CRC-validated PSI section, with the fields the assembler needs to group
/// sections into a table, plus its full encoded bytes (for byte-wise idempotence comparison).
#[derive(Debug, Clone)]
pub struct Section {
    /// `table_id_extension` from [`PsiTableSyntax`] (e.g. program number for a PMT, TSID for a NIT).
    pub table_id_extension: u16,
    /// Version number; all sections of one table must agree.
    pub version: u8,
    /// `last_section_number`; all sections of one table must agree.
    pub last_section_number: u8,
    /// EIT-only: `segment_last_section_number`. `None` for tables without the segmented variant.
    pub segment_last_section_number: Option<u8>,
    /// Full encoded section, header through CRC, exactly as received or as will be transmitted.
    pub raw: Bytes,
}

/// Reassembles ordered section fragments into a complete PSI table (spec.md §4.1).
///
/// Construct with `hole_tolerant = true` for EIT-style tables, where a table is considered
/// complete once, for every segment, either all its sections are present or its declared last
/// section is present (segment-hole tolerance).
#[derive(Debug)]
pub struct SectionAssembler {
    slots: Vec<Option<Section>>,
    hole_tolerant: bool,
    committed: Option<Vec<Bytes>>,
}

impl SectionAssembler {
    /// Creates an empty assembler.
    pub fn new(hole_tolerant: bool) -> Self {
        Self {
            slots: (0..PSI_TABLE_MAX_SECTIONS).map(|_| None).collect(),
            hole_tolerant,
            committed: None,
        }
    }

    /// Inserts a fragment at `section.raw`'s `section_number` slot. Returns `true` when the
    /// table is now complete and ready for structural validation via [`Self::pending_sections`].
    pub fn insert(&mut self, section_number: u8, section: Section) -> bool {
        self.slots[section_number as usize] = Some(section);

        let Some(first) = self.slots[0].as_ref() else {
            return false;
        };
        let last_section_number = first.last_section_number;
        let version = first.version;
        let table_id_extension = first.table_id_extension;

        // Every present fragment must agree with the first on the fields that identify "the same
        // table", regardless of which slots are still missing.
        for slot in self.slots[..=last_section_number as usize].iter().flatten() {
            if slot.last_section_number != last_section_number
                || slot.version != version
                || slot.table_id_extension != table_id_extension
            {
                return false;
            }
        }

        if !self.hole_tolerant {
            if self.slots[..=last_section_number as usize].iter().any(|s| s.is_none()) {
                return false;
            }
        } else {
            // Walk the range one segment at a time: a segment is complete once its own declared
            // last section is present, independent of any holes earlier in that segment
            // (spec.md §4.1/§8 EIT "segment hole" tolerance, e.g. sections {0,3} with
            // segment_last=3 is complete even though 1 and 2 are missing).
            let mut i: usize = 0;
            while i <= last_section_number as usize {
                let Some(j) = (i..=last_section_number as usize).find(|&k| self.slots[k].is_some()) else {
                    return false;
                };
                let seg_last = self.slots[j]
                    .as_ref()
                    .unwrap()
                    .segment_last_section_number
                    .unwrap_or(last_section_number) as usize;
                if seg_last < j || self.slots[seg_last].is_none() {
                    return false;
                }
                i = seg_last + 1;
            }
        }

        // Drop spurious slots past last_section_number left over from a previous, longer table.
        for slot in self.slots[(last_section_number as usize + 1)..].iter_mut() {
            *slot = None;
        }

        true
    }

    /// Returns the complete, ordered sections of the table currently gathered. Only meaningful
    /// right after [`Self::insert`] returns `true`.
    pub fn pending_sections(&self) -> Vec<Bytes> {
        let last_section_number = self.slots[0].as_ref().map_or(0, |s| s.last_section_number);
        (0..=last_section_number)
            .filter_map(|i| self.slots[i as usize].as_ref().map(|s| s.raw.clone()))
            .collect()
    }

    /// True if `candidate` is byte-for-byte identical to the previously committed table
    /// (spec.md §4.1 idempotence).
    pub fn is_same_as_committed(&self, candidate: &[Bytes]) -> bool {
        match &self.committed {
            Some(prev) => prev.len() == candidate.len() && prev.iter().zip(candidate).all(|(a, b)| a == b),
            None => false,
        }
    }

    /// Commits `sections` as the new current table.
    pub fn commit(&mut self, sections: Vec<Bytes>) {
        self.committed = Some(sections);
    }

    /// Drops every gathered section and reinitializes the slot vector. Called on any integrity
    /// failure of the pending table (spec.md §4.1 cancellation policy); no state leaks across
    /// errors because the committed table is untouched.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

/// Parses the 3-byte [`PsiHeader`] plus, if present, the 5-byte [`PsiTableSyntax`], verifies the
/// trailing CRC-32/MPEG-2, and returns the section-assembly key fields alongside the section's
/// body (the bytes between the table syntax and the CRC).
pub fn parse_section<'a>(data: &'a [u8]) -> WireResult<(PsiHeader, PsiTableSyntax, &'a [u8])> {
    let mut reader = SliceReader::new(data);
    let header = read_bitfield!(reader, PsiHeader);
    let section_length = header.section_length() as usize;
    if section_length < 5 || !header.section_syntax_indicator() {
        return Err(reader.make_error(WireErrorKind::BadPsiHeader));
    }
    let syntax = read_bitfield!(reader, PsiTableSyntax);
    let body_and_crc_len = section_length - 5;
    if body_and_crc_len < 4 {
        return Err(reader.make_error(WireErrorKind::BadPsiHeader));
    }
    let mut table_reader = reader.new_sub_reader(body_and_crc_len)?;
    let len_minus_crc = body_and_crc_len - 4;
    let body = table_reader.read(len_minus_crc)?;
    let expected_crc = table_reader.read_be_u32()?;
    let actual_crc = crc32_mpeg2(&data[..3 + 5 + len_minus_crc]);
    if actual_crc != expected_crc {
        return Err(table_reader.make_error(WireErrorKind::PsiCrcMismatch));
    }
    Ok((header, syntax, body))
}

/// Appends a complete section (header, syntax, `body`, CRC) to `out`, computing `section_length`
/// and the trailing CRC-32/MPEG-2 automatically. Mirror of [`parse_section`] for generation.
pub fn build_section(
    table_id: u8,
    table_id_extension: u16,
    version: u8,
    section_num: u8,
    last_section_num: u8,
    body: &[u8],
) -> Bytes {
    let section_length = (5 + body.len() + 4) as u16;
    let header = PsiHeader::new()
        .with_table_id(table_id)
        .with_section_syntax_indicator(true)
        .with_private_bit(false)
        .with_reserved_bits(0b11)
        .with_section_length(section_length);
    let syntax = PsiTableSyntax::new()
        .with_table_id_extension(table_id_extension)
        .with_reserved_bits(0b11)
        .with_version(version)
        .with_current_next_indicator(true)
        .with_section_num(section_num)
        .with_last_section_num(last_section_num);

    let mut out = Vec::with_capacity(3 + 5 + body.len() + 4);
    write_bitfield!(out, header);
    write_bitfield!(out, syntax);
    out.extend_from_slice(body);
    let crc = crc32_mpeg2(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Bytes::from(out)
}

/// Feeds one raw section into `assembler` and, once its table is complete, runs `decode` over
/// the assembled sections. Implements the full commit protocol of spec.md §4.1: a structural
/// validation failure resets the assembler and propagates the error; a table identical to the
/// previously committed one is discarded without notifying the caller (idempotence); otherwise
/// the new table is committed and `decode`'s result is returned exactly once.
pub fn feed_section<T>(
    assembler: &mut SectionAssembler,
    raw: Bytes,
    decode: impl FnOnce(&[Bytes]) -> MuxResult<T>,
) -> MuxResult<Option<T>> {
    feed_section_with_segment(assembler, raw, None, decode)
}

/// Same as [`feed_section`] but lets the caller supply the EIT-only
/// `segment_last_section_number`, for hole-tolerant assemblers.
pub fn feed_section_with_segment<T>(
    assembler: &mut SectionAssembler,
    raw: Bytes,
    segment_last_section_number: Option<u8>,
    decode: impl FnOnce(&[Bytes]) -> MuxResult<T>,
) -> MuxResult<Option<T>> {
    let (_, syntax, _) = parse_section(&raw).map_err(MuxError::from)?;
    let section_num = syntax.section_num();
    let complete = assembler.insert(
        section_num,
        Section {
            table_id_extension: syntax.table_id_extension(),
            version: syntax.version(),
            last_section_number: syntax.last_section_num(),
            segment_last_section_number,
            raw,
        },
    );
    if !complete {
        return Ok(None);
    }

    let sections = assembler.pending_sections();
    match decode(&sections) {
        Ok(value) => {
            if assembler.is_same_as_committed(&sections) {
                Ok(None)
            } else {
                assembler.commit(sections);
                Ok(Some(value))
            }
        }
        Err(e) => {
            assembler.reset();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_section(table_id_extension: u16, version: u8, section_num: u8, last_section_num: u8, body: &[u8]) -> Bytes {
        build_section(0x00, table_id_extension, version, section_num, last_section_num, body)
    }

    #[test]
    fn single_section_table_completes_immediately() {
        let mut asm = SectionAssembler::new(false);
        let raw = make_section(1, 0, 0, 0, &[1, 2, 3]);
        let (_, syntax, _) = parse_section(&raw).unwrap();
        let complete = asm.insert(
            0,
            Section {
                table_id_extension: syntax.table_id_extension(),
                version: syntax.version(),
                last_section_number: syntax.last_section_num(),
                segment_last_section_number: None,
                raw: raw.clone(),
            },
        );
        assert!(complete);
        assert_eq!(asm.pending_sections(), vec![raw]);
    }

    #[test]
    fn multi_section_table_waits_for_all_slots() {
        let mut asm = SectionAssembler::new(false);
        let raw0 = make_section(1, 0, 0, 1, &[1]);
        let raw1 = make_section(1, 0, 1, 1, &[2]);
        let (_, s0, _) = parse_section(&raw0).unwrap();
        let (_, s1, _) = parse_section(&raw1).unwrap();
        let sec = |s: PsiTableSyntax, raw: Bytes| Section {
            table_id_extension: s.table_id_extension(),
            version: s.version(),
            last_section_number: s.last_section_num(),
            segment_last_section_number: None,
            raw,
        };
        assert!(!asm.insert(0, sec(s0, raw0.clone())));
        assert!(asm.insert(1, sec(s1, raw1.clone())));
        assert_eq!(asm.pending_sections(), vec![raw0, raw1]);
    }

    #[test]
    fn idempotent_commit_is_detected() {
        let mut asm = SectionAssembler::new(false);
        let raw = make_section(1, 0, 0, 0, &[9, 9]);
        asm.commit(vec![raw.clone()]);
        assert!(asm.is_same_as_committed(&[raw]));
        assert!(!asm.is_same_as_committed(&[Bytes::from_static(&[1, 2, 3])]));
    }

    #[test]
    fn reset_drops_pending_without_touching_committed() {
        let mut asm = SectionAssembler::new(false);
        let committed = make_section(1, 0, 0, 0, &[1]);
        asm.commit(vec![committed.clone()]);
        let pending = make_section(2, 0, 0, 1, &[2]);
        let (_, s, _) = parse_section(&pending).unwrap();
        asm.insert(
            0,
            Section {
                table_id_extension: s.table_id_extension(),
                version: s.version(),
                last_section_number: s.last_section_num(),
                segment_last_section_number: None,
                raw: pending,
            },
        );
        asm.reset();
        assert!(asm.is_same_as_committed(&[committed]));
    }

    #[test]
    fn eit_segment_hole_is_tolerated() {
        // Sections {0, 3} with segment_last = 3 is complete; {0, 2} is not (spec.md §8).
        let mut asm = SectionAssembler::new(true);
        let sec = |n: u8, seg_last: u8| Section {
            table_id_extension: 1,
            version: 0,
            last_section_number: 3,
            segment_last_section_number: Some(seg_last),
            raw: make_section(1, 0, n, 3, &[n]),
        };
        assert!(!asm.insert(0, sec(0, 3)));
        assert!(asm.insert(3, sec(3, 3)));
    }

    #[test]
    fn eit_segment_hole_incomplete_without_segment_last() {
        let mut asm = SectionAssembler::new(true);
        let sec = |n: u8, seg_last: u8| Section {
            table_id_extension: 1,
            version: 0,
            last_section_number: 3,
            segment_last_section_number: Some(seg_last),
            raw: make_section(1, 0, n, 3, &[n]),
        };
        assert!(!asm.insert(0, sec(0, 1)));
        assert!(!asm.insert(2, sec(2, 3)));
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let mut raw = make_section(1, 0, 0, 0, &[1, 2]).to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(
            parse_section(&raw),
            Err(e) if matches!(e.details(), WireErrorKind::PsiCrcMismatch)
        ));
    }
}
