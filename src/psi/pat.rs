//! Program Association Table: decoder and generator (spec.md §4.2, §4.6).

use crate::error::{MuxError, MuxResult};
use crate::psi::{build_section, parse_section, SectionAssembler, PSI_MAX_SIZE};
use crate::read_bitfield;
use crate::slice_reader::SliceReader;
use crate::write_bitfield;
use bytes::Bytes;
use modular_bitfield_msb::prelude::*;
use std::collections::HashSet;

/// `table_id` for the PAT.
pub const TABLE_ID: u8 = 0x00;

/// One 4-byte PAT entry: a program number mapped to either the NIT PID (program number 0) or a
/// program's PMT PID.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

/// Decoded Program Association Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    /// Transport stream id (the PAT's `table_id_extension`).
    pub tsid: u16,
    /// PID carrying the NIT, if program number 0 is present.
    pub nit_pid: Option<u16>,
    /// `(program_number, pmt_pid)` for every non-zero entry.
    pub programs: Vec<(u16, u16)>,
}

fn decode_sections(sections: &[Bytes]) -> MuxResult<Pat> {
    let mut tsid = None;
    let mut nit_pid = None;
    let mut programs = Vec::new();
    let mut seen = HashSet::new();

    for raw in sections {
        let (_, syntax, body) = parse_section(raw)?;
        let this_tsid = syntax.table_id_extension();
        if let Some(t) = tsid {
            if t != this_tsid {
                return Err(MuxError::Invalid("PAT sections disagree on tsid".into()));
            }
        }
        tsid = Some(this_tsid);

        let mut reader = SliceReader::new(body);
        while reader.remaining_len() >= 4 {
            let entry = read_bitfield!(reader, PatEntry);
            let program_num = entry.program_num();
            if !seen.insert(program_num) {
                return Err(MuxError::Invalid(format!(
                    "duplicate program number {} in PAT",
                    program_num
                )));
            }
            if program_num == 0 {
                nit_pid = Some(entry.program_map_pid());
            } else {
                programs.push((program_num, entry.program_map_pid()));
            }
        }
    }

    Ok(Pat {
        tsid: tsid.unwrap_or(0),
        nit_pid,
        programs,
    })
}

/// PAT section decoder: reassembles PAT sections via a [`SectionAssembler`] and, on a genuine
/// (non-idempotent) commit, returns the decoded [`Pat`].
#[derive(Debug, Default)]
pub struct PatDecoder {
    assembler: SectionAssembler,
}

impl PatDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            assembler: SectionAssembler::new(false),
        }
    }

    /// Feeds one raw section (PID 0). Returns `Ok(Some(pat))` on a new committed table,
    /// `Ok(None)` while gathering or on an idempotent duplicate, `Err` on validation failure
    /// (in which case the pending table has already been reset).
    pub fn push_section(&mut self, raw: Bytes) -> MuxResult<Option<Pat>> {
        super::feed_section(&mut self.assembler, raw, decode_sections)
    }
}

/// Generates PAT sections from the mux's program list, splitting across sections to respect
/// [`PSI_MAX_SIZE`] (spec.md §4.6 PSI generators mirror the decoder direction).
pub fn generate(tsid: u16, nit_pid: Option<u16>, programs: &[(u16, u16)], version: u8) -> Vec<Bytes> {
    const ENTRY_SIZE: usize = 4;
    const SECTION_OVERHEAD: usize = 3 + 5 + 4; // header + syntax + crc
    let max_entries_per_section = (PSI_MAX_SIZE - SECTION_OVERHEAD) / ENTRY_SIZE;

    let mut entries: Vec<(u16, u16)> = Vec::with_capacity(programs.len() + 1);
    if let Some(pid) = nit_pid {
        entries.push((0, pid));
    }
    entries.extend_from_slice(programs);

    if entries.is_empty() {
        return vec![build_section(TABLE_ID, tsid, version, 0, 0, &[])];
    }

    let chunks: Vec<&[(u16, u16)]> = entries.chunks(max_entries_per_section).collect();
    let last_section_num = (chunks.len() - 1) as u8;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut body = Vec::with_capacity(chunk.len() * ENTRY_SIZE);
            for &(program_num, pid) in chunk.iter() {
                let entry = PatEntry::new()
                    .with_program_num(program_num)
                    .with_reserved(0b111)
                    .with_program_map_pid(pid);
                write_bitfield!(body, entry);
            }
            build_section(TABLE_ID, tsid, version, i as u8, last_section_num, &body)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_generate_and_decode() {
        let sections = generate(1, Some(16), &[(1, 256), (2, 512)], 0);
        let mut decoder = PatDecoder::new();
        let mut result = None;
        for s in sections {
            if let Some(pat) = decoder.push_section(s).unwrap() {
                result = Some(pat);
            }
        }
        let pat = result.expect("table should complete");
        assert_eq!(pat.tsid, 1);
        assert_eq!(pat.nit_pid, Some(16));
        assert_eq!(pat.programs, vec![(1, 256), (2, 512)]);
    }

    #[test]
    fn duplicate_program_number_is_rejected() {
        let mut body = Vec::new();
        for &(program_num, pid) in &[(1u16, 256u16), (1u16, 257u16)] {
            let entry = PatEntry::new()
                .with_program_num(program_num)
                .with_reserved(0b111)
                .with_program_map_pid(pid);
            write_bitfield!(body, entry);
        }
        let section = build_section(TABLE_ID, 1, 0, 0, 0, &body);
        let mut decoder = PatDecoder::new();
        assert!(decoder.push_section(section).is_err());
    }

    #[test]
    fn identical_table_is_not_re_emitted() {
        let sections = generate(1, None, &[(1, 256)], 0);
        let mut decoder = PatDecoder::new();
        assert!(decoder.push_section(sections[0].clone()).unwrap().is_some());
        assert!(decoder.push_section(sections[0].clone()).unwrap().is_none());
    }

    #[test]
    fn many_programs_split_across_sections() {
        let programs: Vec<(u16, u16)> = (1..400u16).map(|n| (n, 256 + n)).collect();
        let sections = generate(1, None, &programs, 0);
        assert!(sections.len() > 1);
        let mut decoder = PatDecoder::new();
        let mut result = None;
        for s in sections {
            if let Some(pat) = decoder.push_section(s).unwrap() {
                result = Some(pat);
            }
        }
        assert_eq!(result.unwrap().programs.len(), programs.len());
    }
}
