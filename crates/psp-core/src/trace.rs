//! Dispatch trace file, compiled in behind the `trace` feature.
//!
//! Records the PC and instruction word at every dispatcher entry. The output
//! path comes from `PSP_TRACE_FILE`; without it, tracing stays off even when
//! the feature is enabled.

use std::fs::File;
use std::io::{BufWriter, Write};

pub struct Tracer {
    out: BufWriter<File>,
}

impl Tracer {
    pub fn from_env() -> Option<Self> {
        let path = std::env::var("PSP_TRACE_FILE").ok()?;
        match File::create(&path) {
            Ok(file) => Some(Self { out: BufWriter::new(file) }),
            Err(err) => {
                log::warn!("cannot open trace file {:?}: {}", path, err);
                None
            }
        }
    }

    pub fn record(&mut self, pc: u32, word: u32) {
        let _ = writeln!(self.out, "{:08X} {:08X}", pc, word);
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}
