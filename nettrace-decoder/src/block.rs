use std::io::Read;

use nettrace_format::{ByteReader, FormatError};

use crate::stream::StreamReader;
use crate::Result;

/// The closed set of serialized object kinds a trace may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Entry header; appears as a block only in V1/V2 streams.
    Trace,
    Event,
    Metadata,
    SequencePoint,
    Stack,
    Unknown,
}

impl BlockKind {
    pub fn from_name(name: &str) -> BlockKind {
        match name {
            "Trace" => BlockKind::Trace,
            "EventBlock" => BlockKind::Event,
            "MetadataBlock" => BlockKind::Metadata,
            "SPBlock" => BlockKind::SequencePoint,
            "StackBlock" => BlockKind::Stack,
            _ => BlockKind::Unknown,
        }
    }
}

/// Read one block body: u32 size, padding to the next 4-byte file offset,
/// then the contents. The cursor is pinned to `blockStart + size` afterwards
/// regardless of how much the caller's parser will consume, and the
/// trailing end-object tag is checked.
pub fn read_block<R: Read>(reader: &mut StreamReader<R>) -> Result<Vec<u8>> {
    let size = reader.read_i32()?;
    if size < 0 {
        return Err(FormatError::InvalidFormat("negative block size").into());
    }
    reader.align4()?;
    let start = reader.position();
    let contents = reader.read_vec(size as usize)?;
    reader.goto(start.add(size as u64))?;
    crate::preamble::expect_end_object(reader)?;
    Ok(contents)
}

/// Header prefixing EventBlock and MetadataBlock contents in V4+.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBlockHeader {
    pub header_size: u16,
    pub flags: u16,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
}

impl EventBlockHeader {
    pub fn compressed(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// Parse the block header and leave the cursor at the first event, honouring
/// `header_size` so future header growth is skipped rather than misread.
pub fn parse_event_block_header(r: &mut ByteReader<'_>) -> Result<EventBlockHeader> {
    let header_size = r.read_i16()?;
    if header_size < 20 {
        return Err(FormatError::InvalidFormat("event block header too small").into());
    }
    let flags = r.read_i16()? as u16;
    let min_timestamp = r.read_u64()?;
    let max_timestamp = r.read_u64()?;
    r.set_position(header_size as usize)?;
    Ok(EventBlockHeader {
        header_size: header_size as u16,
        flags,
        min_timestamp,
        max_timestamp,
    })
}
