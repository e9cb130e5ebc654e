//! Time and Date Table: decoder and generator (spec.md §4.2, §4.6).
//!
//! Unlike every other PSI table in this module, the TDT carries `section_syntax_indicator = 0`
//! (ETSI EN 300 468 §5.2.5): it has no `table_id_extension`, no version, and no CRC-protected
//! multi-section structure, so it bypasses [`crate::psi::SectionAssembler`] entirely and is
//! decoded straight off the 3-byte [`crate::psi::PsiHeader`] plus its 5-byte UTC payload.

use crate::error::{MuxError, MuxResult};
use crate::psi::eit::{decode_start_time, encode_start_time, DvbDateTime};
use crate::psi::PsiHeader;
use crate::{read_bitfield, write_bitfield};
use crate::slice_reader::SliceReader;
use bytes::Bytes;

/// `table_id` for the TDT.
pub const TABLE_ID: u8 = 0x70;

/// Decodes one raw TDT section into the UTC date/time it carries.
pub fn decode(raw: &[u8]) -> MuxResult<DvbDateTime> {
    let mut reader = SliceReader::new(raw);
    let header = read_bitfield!(reader, PsiHeader);
    if header.table_id() != TABLE_ID {
        return Err(MuxError::Invalid(format!("unexpected table_id {:#x} for TDT", header.table_id())));
    }
    if header.section_syntax_indicator() {
        return Err(MuxError::Invalid("TDT must not set section_syntax_indicator".into()));
    }
    let body = reader.read(header.section_length() as usize)?;
    if body.len() < 5 {
        return Err(MuxError::Invalid("TDT body too short".into()));
    }
    let start_time = u64::from_be_bytes([0, 0, 0, body[0], body[1], body[2], body[3], body[4]]);
    Ok(decode_start_time(start_time))
}

/// Builds one raw TDT section carrying `utc`.
pub fn generate(utc: &DvbDateTime) -> Bytes {
    let raw_time = encode_start_time(utc);
    let body = raw_time.to_be_bytes();
    let body = &body[3..]; // low 40 bits

    let header = PsiHeader::new()
        .with_table_id(TABLE_ID)
        .with_section_syntax_indicator(false)
        .with_private_bit(false)
        .with_reserved_bits(0b11)
        .with_section_length(body.len() as u16);

    let mut out = Vec::with_capacity(3 + body.len());
    write_bitfield!(out, header);
    out.extend_from_slice(body);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_generate_and_decode() {
        let dt = DvbDateTime {
            year: 2026,
            month: 7,
            day: 28,
            hour: 9,
            minute: 15,
            second: 0,
        };
        let section = generate(&dt);
        let decoded = decode(&section).unwrap();
        assert_eq!(decoded.hour, dt.hour);
        assert_eq!(decoded.minute, dt.minute);
    }

    #[test]
    fn wrong_table_id_is_rejected() {
        let mut section = generate(&DvbDateTime {
            year: 2026,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        })
        .to_vec();
        section[0] = 0x71;
        assert!(decode(&section).is_err());
    }
}
