//! Drives a [`mpegts_mux::Mux`] with a single synthetic H.264 program and writes the resulting
//! TS packets to a file, to demonstrate the scheduler end to end.
//!
//! Usage: `dump <output.ts> [num_ticks]`

use bytes::Bytes;
use mpegts_mux::{FlowDefinition, Mux, Uref};
use std::env;
use std::fs::File;
use std::io::Write;

const UCLOCK_FREQ: u64 = 27_000_000;

fn video_flow_def() -> FlowDefinition {
    FlowDefinition {
        def: "block.h264.pic.".to_string(),
        raw_def: String::new(),
        pid: 256,
        sid: 1,
        octetrate: 2_000_000,
        buffer_size: 229_376,
        fps: None,
        samples: None,
        rate: None,
        channels: None,
        tb_rate: 2_000_000,
        pes_id: 0xe0,
        pes_header_minimum: 14,
        pes_min_duration: 0,
        pes_alignment: true,
        max_delay: UCLOCK_FREQ * 10,
        descriptors: Vec::new(),
        latency: 0,
    }
}

fn main() {
    pretty_env_logger::init();
    let mut args = env::args().skip(1);
    let out_path = args.next().expect("usage: dump <output.ts> [num_ticks]");
    let num_ticks: u64 = args.next().map(|s| s.parse().expect("num_ticks must be an integer")).unwrap_or(100);

    let mut mux = Mux::new(1);
    mux.add_program(1, Some(4096)).expect("add_program");
    mux.add_input(1, Some(256)).expect("add_input").set_flow_def(video_flow_def());
    mux.program_mut(1).unwrap().recompute_pcr_carrier();
    mux.end_preroll();

    let mut out = File::create(&out_path).expect("unable to create output file");
    let mut cr_sys = 0u64;
    let frame_interval = UCLOCK_FREQ / 25;
    let mut next_frame = 0u64;

    for _ in 0..num_ticks {
        if cr_sys >= next_frame {
            if let Some(input) = mux.program_mut(1).and_then(|p| p.input_mut(256)) {
                let payload = Bytes::from(vec![0xffu8; 4096]);
                input.input(cr_sys, Uref::new(payload, cr_sys, cr_sys)).expect("input admission");
            }
            next_frame += frame_interval;
        }
        let packets = mux.tick(cr_sys);
        out.write_all(&packets).expect("write failed");
        cr_sys = mux.cr_sys();
    }

    println!("wrote {} ticks worth of TS packets to {}", num_ticks, out_path);
}
