//! SCTE-35 splice information section generator (spec.md §4.2 sidecar input).
//!
//! This mux only ever generates SCTE-35 sections from sidecar splice commands handed to it by
//! the caller — it never decodes SCTE-35 from an upstream input (spec.md §4 Non-goals exclude
//! demuxing beyond PSI round-trip, and SCTE-35 is not a PSI table this mux reassembles from a
//! multiplexed source).

use crate::psi::{crc32_mpeg2, PsiHeader};
use crate::write_bitfield;
use bytes::Bytes;

/// `table_id` for a `splice_info_section`.
pub const TABLE_ID: u8 = 0xfc;

/// A `splice_insert()` command requesting an immediate, program-level splice (the common "cue
/// out"/"cue in" case). Scheduled (non-immediate) splices and component-level splicing are out
/// of scope, matching this mux's treatment of SCTE-35 as a sidecar command stream rather than a
/// full splice-session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceInsert {
    /// `splice_event_id`.
    pub event_id: u32,
    /// `out_of_network_indicator`: true to leave the network (cue out), false to return (cue in).
    pub out_of_network: bool,
}

/// One SCTE-35 splice command a sidecar input can ask the mux to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceCommand {
    /// `splice_null()`: a heartbeat with no effect, keeps the PID flowing between splice points.
    Null,
    /// `splice_insert()`.
    Insert(SpliceInsert),
}

const SPLICE_COMMAND_TYPE_NULL: u8 = 0x00;
const SPLICE_COMMAND_TYPE_INSERT: u8 = 0x05;

fn encode_splice_command(command: &SpliceCommand) -> (u8, Vec<u8>) {
    match command {
        SpliceCommand::Null => (SPLICE_COMMAND_TYPE_NULL, Vec::new()),
        SpliceCommand::Insert(insert) => {
            let mut out = Vec::with_capacity(10);
            out.extend_from_slice(&insert.event_id.to_be_bytes());
            out.push(0x7f); // splice_event_cancel_indicator(0) + reserved(7, all ones)
            let out_of_network_bit = if insert.out_of_network { 0x80 } else { 0x00 };
            // out_of_network_indicator | program_splice_flag(1) | duration_flag(0) | splice_immediate_flag(1) | reserved(4)
            out.push(out_of_network_bit | 0x40 | 0x10 | 0x0f);
            out.extend_from_slice(&0u16.to_be_bytes()); // unique_program_id
            out.push(0); // avail_num
            out.push(0); // avails_expected
            (SPLICE_COMMAND_TYPE_INSERT, out)
        }
    }
}

/// Builds one `splice_info_section` carrying `command`. `pts_adjustment` is in 90kHz ticks, per
/// the SCTE-35 wire format (this mux's own clock is 27MHz elsewhere; callers convert).
pub fn generate(command: &SpliceCommand, pts_adjustment: u64) -> Bytes {
    let (splice_command_type, splice_command) = encode_splice_command(command);
    let splice_command_length = splice_command.len() as u16;

    let mut body = Vec::new();
    body.push(0); // protocol_version

    // encrypted_packet(1)=0, encryption_algorithm(6)=0, pts_adjustment(33) packed into 40 bits.
    let pts_field: u64 = (pts_adjustment & 0x1_ffff_ffff) as u64;
    let pts_bytes = pts_field.to_be_bytes();
    body.extend_from_slice(&pts_bytes[3..]); // low 5 bytes of the 40-bit field

    body.push(0); // cw_index

    let tier_and_len: u32 = (0xfffu32 << 12) | (splice_command_length as u32 & 0xfff);
    let tier_bytes = tier_and_len.to_be_bytes();
    body.extend_from_slice(&tier_bytes[1..]); // low 3 bytes (24 bits)

    body.push(splice_command_type);
    body.extend_from_slice(&splice_command);
    body.extend_from_slice(&0u16.to_be_bytes()); // descriptor_loop_length = 0

    let section_length = (body.len() + 4) as u16; // + CRC_32
    let header = PsiHeader::new()
        .with_table_id(TABLE_ID)
        .with_section_syntax_indicator(false)
        .with_private_bit(true)
        .with_reserved_bits(0b11)
        .with_section_length(section_length);

    let mut out = Vec::with_capacity(3 + body.len() + 4);
    write_bitfield!(out, header);
    out.extend_from_slice(&body);
    let crc = crc32_mpeg2(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_command_has_expected_table_id_and_type() {
        let section = generate(&SpliceCommand::Null, 0);
        assert_eq!(section[0], TABLE_ID);
        // splice_command_type sits right after the 11-byte fixed prefix (3 header + 8 up to cw_index/tier).
        assert_eq!(section[11], SPLICE_COMMAND_TYPE_NULL);
    }

    #[test]
    fn insert_command_carries_event_id_and_flags() {
        let insert = SpliceInsert {
            event_id: 0xdead_beef,
            out_of_network: true,
        };
        let section = generate(&SpliceCommand::Insert(insert), 12345);
        assert_eq!(section[11], SPLICE_COMMAND_TYPE_INSERT);
        let event_id = u32::from_be_bytes([section[12], section[13], section[14], section[15]]);
        assert_eq!(event_id, insert.event_id);
        assert_eq!(section[17] & 0x80, 0x80); // out_of_network_indicator
    }
}
