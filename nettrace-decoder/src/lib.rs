//! Streaming decoder for the Nettrace/NetPerf trace format.
//!
//! A trace is a byte stream: an optional `Nettrace` magic, a serialization
//! preamble, one `Trace` entry object with trace-wide parameters, then
//! (V4+) a sequence of named blocks or (V1–V3) a flat run of events. The
//! decoder reconstructs typed events from it — joining in-band metadata
//! descriptors, interned stacks and per-thread event streams — and hands
//! them to a sink in global timestamp order.
//!
//! ```no_run
//! use std::fs::File;
//! use nettrace_decoder::{Decoder, EventRecord};
//!
//! # fn main() -> nettrace_decoder::Result<()> {
//! let file = File::open("app.nettrace")?;
//! let decoder = Decoder::new(file, |event: EventRecord| {
//!     println!("{} {:?} @ {}", event.provider_name, event.event_name, event.timestamp);
//! });
//! let summary = decoder.process()?;
//! println!("{} events, {} lost", summary.events_dispatched, summary.events_lost);
//! # Ok(())
//! # }
//! ```

use nettrace_format::FormatError;
use thiserror::Error;

pub mod block;
pub mod decoder;
pub mod dispatch;
pub mod event;
pub mod instrument;
pub mod metadata;
pub mod preamble;
pub mod sorter;
pub mod stacks;
pub mod stream;

pub use decoder::{DecodeSummary, Decoder};
pub use dispatch::{EventRecord, EventSink};
pub use instrument::{DecodeHooks, Instrumentation, NoopHooks};
pub use stream::{StreamLabel, StreamReader};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
