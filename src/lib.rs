//! An MPEG-2 Transport Stream multiplexer.
//!
//! A [`Mux`] schedules one or more [`Program`]s, each carrying one or more [`Input`]s, onto a
//! single constant- or capped-bitrate TS. Every elementary stream admitted through an `Input` is
//! rate-shaped by a T-STD buffer model, packetized into PES, and spliced into 188-byte TS packets
//! alongside PAT/CAT/PMT/NIT/SDT/EIT/TDT tables the mux regenerates as programs and services
//! change.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! mpegts-mux = "~0.1.0"
//! ```
//!
//! ```
//! use mpegts_mux::{Mux, FlowDefinition};
//!
//! let mut mux = Mux::new(1);
//! mux.add_program(1, None).unwrap();
//! mux.add_input(1, Some(256)).unwrap().set_flow_def(FlowDefinition {
//!     def: "block.h264.pic.".to_string(),
//!     raw_def: String::new(),
//!     pid: 256,
//!     sid: 1,
//!     octetrate: 200_000,
//!     buffer_size: 229376,
//!     fps: None,
//!     samples: None,
//!     rate: None,
//!     channels: None,
//!     tb_rate: 1_000_000,
//!     pes_id: 0xe0,
//!     pes_header_minimum: 14,
//!     pes_min_duration: 0,
//!     pes_alignment: true,
//!     max_delay: 27_000_000,
//!     descriptors: Vec::new(),
//!     latency: 0,
//! });
//! mux.program_mut(1).unwrap().recompute_pcr_carrier();
//!
//! let out = mux.tick(0);
//! assert_eq!(out.len(), mux.output_size());
//! ```

#![deny(missing_docs, unsafe_code)]

mod conformance;
mod dvb_string;
mod encaps;
mod error;
mod flow_def;
mod input;
mod packet;
mod pes;
mod program;
mod psi;
mod psi_carrier;
mod psi_join;
mod slice_reader;
mod tstd;
mod uref;

mod mux;

pub use conformance::Conformance;
pub use error::{MuxError, MuxResult, WireError, WireErrorKind, WireResult};
pub use flow_def::{stream_type, FlowDefinition, InputType};
pub use input::Input;
pub use mux::{Mode, Mux};
pub use packet::{PID_NULL, TS_SIZE, TS_SYNC_BYTE};
pub use program::{DvbService, Program};
pub use psi::cat::Cat;
pub use psi::descriptors::{ConditionalAccessEntry, Descriptor, LanguageEntry, CA_SYSTEM_ID_BISS};
pub use psi::eit::{DvbDateTime, DvbDuration, EitEvent};
pub use psi::nit::{Nit, NitTransportStream};
pub use psi::pat::Pat;
pub use psi::pmt::{Pmt, PmtStream};
pub use psi::sdt::{Sdt, SdtService};
pub use slice_reader::SliceReader;
pub use uref::{Ubuf, Uref};
