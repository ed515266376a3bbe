use nettrace_format::{ByteReader, EventHeader, FormatError};

use crate::Result;

/// Upper bound on an event's non-header extent. The documented bound is
/// 0x10000, but BulkSurvivingObjectRanges events from real emitters exceed
/// it; the looser bound is load-bearing.
pub const MAX_TOTAL_NON_HEADER_SIZE: u32 = 0x20000;

/// Stacks larger than this never occur in well-formed traces.
pub const MAX_STACK_BYTES: u32 = 800;

/// Fixed header extents, net of the trailing variable-length slot.
const V3_HEADER_SIZE: u32 = 56;
const V4_HEADER_SIZE: u32 = 80;

/// Compressed header flag bits, LSB first.
const FLAG_METADATA_ID: u8 = 1 << 0;
const FLAG_CAPTURE_THREAD_AND_SEQUENCE: u8 = 1 << 1;
const FLAG_THREAD_ID: u8 = 1 << 2;
const FLAG_STACK_ID: u8 = 1 << 3;
const FLAG_ACTIVITY_ID: u8 = 1 << 4;
const FLAG_RELATED_ACTIVITY_ID: u8 = 1 << 5;
const FLAG_SORTED: u8 = 1 << 6;
const FLAG_DATA_LENGTH: u8 = 1 << 7;

/// One decoded event, with payload (and the V3 inline stack) borrowed from
/// the block buffer. Buffering an event past the block boundary requires
/// copying these spans out.
#[derive(Debug)]
pub struct ParsedEvent<'a> {
    pub header: EventHeader,
    pub payload: &'a [u8],
    pub inline_stack: Option<&'a [u8]>,
}

/// Per-block event header decoder.
///
/// Compressed headers inherit from the previous event in the same block, so
/// one parser instance must not outlive its block.
pub struct EventParser {
    previous: EventHeader,
    compressed: bool,
    file_format_version: u32,
}

impl EventParser {
    pub fn for_block(file_format_version: u32, compressed: bool) -> Self {
        EventParser {
            previous: EventHeader::default(),
            compressed,
            file_format_version,
        }
    }

    pub fn parse<'a>(&mut self, r: &mut ByteReader<'a>) -> Result<ParsedEvent<'a>> {
        if self.file_format_version <= 3 {
            parse_v3(r)
        } else if self.compressed {
            self.parse_compressed(r)
        } else {
            parse_v4_uncompressed(r)
        }
    }

    fn parse_compressed<'a>(&mut self, r: &mut ByteReader<'a>) -> Result<ParsedEvent<'a>> {
        let header_start = r.position();
        let mut header = self.previous.clone();
        let flags = r.read_u8()?;

        if flags & FLAG_METADATA_ID != 0 {
            header.metadata_id = r.read_varuint32()?;
        }
        if flags & FLAG_CAPTURE_THREAD_AND_SEQUENCE != 0 {
            header.sequence_number = header
                .sequence_number
                .wrapping_add(r.read_varuint32()?.wrapping_add(1));
            header.capture_thread_id = r.read_varuint64()?;
            header.capture_processor_number = r.read_varuint32()?;
        } else if header.metadata_id != 0 {
            header.sequence_number = header.sequence_number.wrapping_add(1);
        }
        if flags & FLAG_THREAD_ID != 0 {
            header.thread_id = r.read_varuint64()?;
        }
        if flags & FLAG_STACK_ID != 0 {
            header.stack_id = r.read_varuint32()?;
        }
        header.timestamp = header.timestamp.wrapping_add(r.read_varuint64()?);
        if flags & FLAG_ACTIVITY_ID != 0 {
            header.activity_id = r.read_guid()?;
        }
        if flags & FLAG_RELATED_ACTIVITY_ID != 0 {
            header.related_activity_id = r.read_guid()?;
        }
        header.is_sorted = flags & FLAG_SORTED != 0;
        if flags & FLAG_DATA_LENGTH != 0 {
            header.payload_size = r.read_varuint32()?;
        }

        if header.payload_size >= MAX_TOTAL_NON_HEADER_SIZE {
            return Err(FormatError::InvalidFormat("compressed event payload too large").into());
        }

        header.header_size = (r.position() - header_start) as u32;
        header.total_non_header_size = header.payload_size;
        header.event_size = (header.header_size + header.payload_size).saturating_sub(4);

        let payload = r.read_bytes(header.payload_size as usize)?;
        self.previous = header.clone();
        Ok(ParsedEvent {
            header,
            payload,
            inline_stack: None,
        })
    }
}

fn parse_v3<'a>(r: &mut ByteReader<'a>) -> Result<ParsedEvent<'a>> {
    let event_start = r.position();
    let event_size = read_size(r, "negative event size")?;
    let metadata_id = r.read_i32()? as u32;
    let thread_id = u64::from(r.read_i32()? as u32);
    let timestamp = r.read_i64()? as u64;
    let activity_id = r.read_guid()?;
    let related_activity_id = r.read_guid()?;
    let payload_size = read_size(r, "negative payload size")?;

    let total_non_header_size = (event_size + 4)
        .checked_sub(V3_HEADER_SIZE)
        .ok_or(FormatError::InvalidFormat("event smaller than its header"))?;
    if total_non_header_size >= MAX_TOTAL_NON_HEADER_SIZE {
        return Err(FormatError::InvalidFormat("event exceeds the size cap").into());
    }
    if payload_size > total_non_header_size {
        return Err(FormatError::InvalidFormat("payload overruns the event").into());
    }
    debug_assert!(payload_size % 4 == 0, "V3 payloads are 4-byte aligned");
    debug_assert!(total_non_header_size % 4 == 0);

    let payload = r.read_bytes(payload_size as usize)?;
    let stack_size = read_size(r, "negative stack size")?;
    if stack_size > MAX_STACK_BYTES {
        return Err(FormatError::InvalidFormat("stack exceeds the size cap").into());
    }
    let inline_stack = r.read_bytes(stack_size as usize)?;

    // Pin to the declared extent whether or not the fields filled it.
    let end = event_start + 4 + event_size as usize;
    if r.position() > end {
        return Err(FormatError::InvalidFormat("event fields overran the declared size").into());
    }
    r.set_position(end)?;

    Ok(ParsedEvent {
        header: EventHeader {
            event_size,
            metadata_id,
            // V3 streams are emitted in order.
            is_sorted: true,
            sequence_number: 0,
            capture_thread_id: thread_id,
            capture_processor_number: 0,
            thread_id,
            timestamp,
            activity_id,
            related_activity_id,
            payload_size,
            stack_id: 0,
            header_size: V3_HEADER_SIZE,
            total_non_header_size,
        },
        payload,
        inline_stack: Some(inline_stack),
    })
}

fn parse_v4_uncompressed<'a>(r: &mut ByteReader<'a>) -> Result<ParsedEvent<'a>> {
    let event_start = r.position();
    let event_size = read_size(r, "negative event size")?;
    let raw_metadata_id = r.read_u32()?;
    let sequence_number = r.read_u32()?;
    let thread_id = r.read_u64()?;
    let capture_thread_id = r.read_u64()?;
    let capture_processor_number = r.read_u32()?;
    let stack_id = r.read_u32()?;
    let timestamp = r.read_u64()?;
    let activity_id = r.read_guid()?;
    let related_activity_id = r.read_guid()?;
    let payload_size = read_size(r, "negative payload size")?;

    let total_non_header_size = (event_size + 4)
        .checked_sub(V4_HEADER_SIZE)
        .ok_or(FormatError::InvalidFormat("event smaller than its header"))?;
    if total_non_header_size >= MAX_TOTAL_NON_HEADER_SIZE {
        return Err(FormatError::InvalidFormat("event exceeds the size cap").into());
    }
    if payload_size > total_non_header_size {
        return Err(FormatError::InvalidFormat("payload overruns the event").into());
    }

    let payload = r.read_bytes(payload_size as usize)?;

    let end = event_start + 4 + event_size as usize;
    if r.position() > end {
        return Err(FormatError::InvalidFormat("event fields overran the declared size").into());
    }
    r.set_position(end)?;

    Ok(ParsedEvent {
        header: EventHeader {
            event_size,
            metadata_id: raw_metadata_id & 0x7fff_ffff,
            // Top bit set marks an out-of-order emission.
            is_sorted: raw_metadata_id & 0x8000_0000 == 0,
            sequence_number,
            capture_thread_id,
            capture_processor_number,
            thread_id,
            timestamp,
            activity_id,
            related_activity_id,
            payload_size,
            stack_id,
            header_size: V4_HEADER_SIZE,
            total_non_header_size,
        },
        payload,
        inline_stack: None,
    })
}

fn read_size(r: &mut ByteReader<'_>, what: &'static str) -> Result<u32> {
    let value = r.read_i32()?;
    if value < 0 {
        return Err(FormatError::InvalidFormat(what).into());
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettrace_format::Guid;

    fn varuint(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        while v >= 0x80 {
            out.push((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        out.push(v as u8);
        out
    }

    fn encode_v4_uncompressed(header: &EventHeader, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let event_size = V4_HEADER_SIZE - 4 + payload.len() as u32;
        out.extend_from_slice(&(event_size as i32).to_le_bytes());
        let raw = header.metadata_id | if header.is_sorted { 0 } else { 0x8000_0000 };
        out.extend_from_slice(&raw.to_le_bytes());
        out.extend_from_slice(&header.sequence_number.to_le_bytes());
        out.extend_from_slice(&header.thread_id.to_le_bytes());
        out.extend_from_slice(&header.capture_thread_id.to_le_bytes());
        out.extend_from_slice(&header.capture_processor_number.to_le_bytes());
        out.extend_from_slice(&header.stack_id.to_le_bytes());
        out.extend_from_slice(&header.timestamp.to_le_bytes());
        out.extend_from_slice(header.activity_id.as_bytes());
        out.extend_from_slice(header.related_activity_id.as_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn sample_header() -> EventHeader {
        EventHeader {
            metadata_id: 3,
            is_sorted: false,
            sequence_number: 5,
            capture_thread_id: 9,
            capture_processor_number: 2,
            thread_id: 7,
            timestamp: 1000,
            activity_id: Guid::from_fields(0x11, 0x22, 0x33, [1, 2, 3, 4, 5, 6, 7, 8]),
            related_activity_id: Guid::ZERO,
            stack_id: 4,
            ..EventHeader::default()
        }
    }

    #[test]
    fn v4_uncompressed_round_trip() {
        let header = sample_header();
        let payload = [1u8, 2, 3, 4];
        let bytes = encode_v4_uncompressed(&header, &payload);
        let mut r = ByteReader::new(&bytes);
        let mut parser = EventParser::for_block(4, false);
        let parsed = parser.parse(&mut r).unwrap();
        assert_eq!(parsed.header.metadata_id, 3);
        assert!(!parsed.header.is_sorted);
        assert_eq!(parsed.header.sequence_number, 5);
        assert_eq!(parsed.header.capture_thread_id, 9);
        assert_eq!(parsed.header.thread_id, 7);
        assert_eq!(parsed.header.stack_id, 4);
        assert_eq!(parsed.payload, &payload);
        assert!(r.is_empty());
    }

    #[test]
    fn sorted_flag_is_the_inverted_top_bit() {
        let mut header = sample_header();
        header.is_sorted = true;
        let bytes = encode_v4_uncompressed(&header, &[]);
        let mut r = ByteReader::new(&bytes);
        let parsed = EventParser::for_block(4, false).parse(&mut r).unwrap();
        assert!(parsed.header.is_sorted);
        assert_eq!(parsed.header.metadata_id, 3);
    }

    /// The same logical event encoded uncompressed and then under
    /// compression flags must decode to identical fields.
    #[test]
    fn compression_round_trip_matches_uncompressed() {
        let first = sample_header();
        let payload = [9u8, 8, 7, 6];

        // Block carrying the first event fully-specified, then a compressed
        // repeat that only moves the timestamp.
        let mut compressed = Vec::new();
        let flags = FLAG_METADATA_ID
            | FLAG_CAPTURE_THREAD_AND_SEQUENCE
            | FLAG_THREAD_ID
            | FLAG_STACK_ID
            | FLAG_ACTIVITY_ID
            | FLAG_RELATED_ACTIVITY_ID
            | FLAG_DATA_LENGTH;
        compressed.push(flags);
        compressed.extend_from_slice(&varuint(u64::from(first.metadata_id)));
        compressed.extend_from_slice(&varuint(4)); // sequence delta 4 + 1 => 5
        compressed.extend_from_slice(&varuint(first.capture_thread_id));
        compressed.extend_from_slice(&varuint(u64::from(first.capture_processor_number)));
        compressed.extend_from_slice(&varuint(first.thread_id));
        compressed.extend_from_slice(&varuint(u64::from(first.stack_id)));
        compressed.extend_from_slice(&varuint(first.timestamp)); // delta from 0
        compressed.extend_from_slice(first.activity_id.as_bytes());
        compressed.extend_from_slice(first.related_activity_id.as_bytes());
        compressed.extend_from_slice(&varuint(payload.len() as u64));
        compressed.extend_from_slice(&payload);

        let uncompressed = encode_v4_uncompressed(&first, &payload);
        let mut ur = ByteReader::new(&uncompressed);
        let from_plain = EventParser::for_block(4, false).parse(&mut ur).unwrap();

        let mut cr = ByteReader::new(&compressed);
        let from_compressed = EventParser::for_block(4, true).parse(&mut cr).unwrap();

        assert_eq!(from_plain.header.metadata_id, from_compressed.header.metadata_id);
        assert_eq!(from_plain.header.sequence_number, from_compressed.header.sequence_number);
        assert_eq!(from_plain.header.capture_thread_id, from_compressed.header.capture_thread_id);
        assert_eq!(
            from_plain.header.capture_processor_number,
            from_compressed.header.capture_processor_number
        );
        assert_eq!(from_plain.header.thread_id, from_compressed.header.thread_id);
        assert_eq!(from_plain.header.stack_id, from_compressed.header.stack_id);
        assert_eq!(from_plain.header.timestamp, from_compressed.header.timestamp);
        assert_eq!(from_plain.header.activity_id, from_compressed.header.activity_id);
        assert_eq!(from_plain.header.payload_size, from_compressed.header.payload_size);
        assert_eq!(from_plain.payload, from_compressed.payload);
    }

    #[test]
    fn compressed_events_inherit_previous_fields() {
        let mut block = Vec::new();
        // First event: everything explicit.
        block.push(FLAG_METADATA_ID | FLAG_CAPTURE_THREAD_AND_SEQUENCE | FLAG_THREAD_ID | FLAG_DATA_LENGTH);
        block.extend_from_slice(&varuint(2)); // metadata id
        block.extend_from_slice(&varuint(0)); // sequence 0 + 1 => 1
        block.extend_from_slice(&varuint(40)); // capture thread
        block.extend_from_slice(&varuint(1)); // processor
        block.extend_from_slice(&varuint(41)); // thread
        block.extend_from_slice(&varuint(1000)); // timestamp delta
        block.extend_from_slice(&varuint(2)); // payload size
        block.extend_from_slice(&[0xca, 0xfe]);
        // Second event: only a timestamp delta; everything else inherited,
        // sequence bumps implicitly because metadata id is non-zero.
        block.push(0);
        block.extend_from_slice(&varuint(50));
        block.extend_from_slice(&[0xbe, 0xef]);

        let mut r = ByteReader::new(&block);
        let mut parser = EventParser::for_block(4, true);
        let first = parser.parse(&mut r).unwrap();
        assert_eq!(first.header.sequence_number, 1);
        assert_eq!(first.header.timestamp, 1000);

        let second = parser.parse(&mut r).unwrap();
        assert_eq!(second.header.metadata_id, 2);
        assert_eq!(second.header.sequence_number, 2);
        assert_eq!(second.header.timestamp, 1050);
        assert_eq!(second.header.capture_thread_id, 40);
        assert_eq!(second.header.payload_size, 2);
        assert_eq!(second.payload, &[0xbe, 0xef]);
        assert!(r.is_empty());
    }

    #[test]
    fn metadata_events_do_not_bump_sequence_implicitly() {
        let mut block = Vec::new();
        block.push(FLAG_METADATA_ID | FLAG_DATA_LENGTH);
        block.extend_from_slice(&varuint(0)); // metadata event
        block.extend_from_slice(&varuint(100)); // timestamp delta
        block.extend_from_slice(&varuint(0)); // empty payload
        let mut r = ByteReader::new(&block);
        let mut parser = EventParser::for_block(4, true);
        let parsed = parser.parse(&mut r).unwrap();
        assert_eq!(parsed.header.metadata_id, 0);
        assert_eq!(parsed.header.sequence_number, 0);
    }

    #[test]
    fn v3_event_with_inline_stack() {
        let payload = [1u8, 2, 3, 4];
        let stack = [0u8; 8];
        let mut out = Vec::new();
        let event_size = V3_HEADER_SIZE - 4 + payload.len() as u32 + 4 + stack.len() as u32;
        out.extend_from_slice(&(event_size as i32).to_le_bytes());
        out.extend_from_slice(&1i32.to_le_bytes()); // metadata id
        out.extend_from_slice(&7i32.to_le_bytes()); // thread id
        out.extend_from_slice(&100i64.to_le_bytes()); // timestamp
        out.extend_from_slice(Guid::ZERO.as_bytes());
        out.extend_from_slice(Guid::ZERO.as_bytes());
        out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&(stack.len() as i32).to_le_bytes());
        out.extend_from_slice(&stack);

        let mut r = ByteReader::new(&out);
        let parsed = EventParser::for_block(3, false).parse(&mut r).unwrap();
        assert_eq!(parsed.header.metadata_id, 1);
        assert_eq!(parsed.header.thread_id, 7);
        assert_eq!(parsed.header.timestamp, 100);
        assert_eq!(parsed.payload, &payload);
        assert_eq!(parsed.inline_stack, Some(&stack[..]));
        assert!(parsed.header.is_sorted);
        assert!(r.is_empty());
    }

    #[test]
    fn v3_oversized_stack_is_rejected() {
        let mut out = Vec::new();
        let stack_len = (MAX_STACK_BYTES + 4) as usize;
        let event_size = V3_HEADER_SIZE - 4 + 4 + stack_len as u32;
        out.extend_from_slice(&(event_size as i32).to_le_bytes());
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&7i32.to_le_bytes());
        out.extend_from_slice(&100i64.to_le_bytes());
        out.extend_from_slice(Guid::ZERO.as_bytes());
        out.extend_from_slice(Guid::ZERO.as_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&(stack_len as i32).to_le_bytes());
        out.extend_from_slice(&vec![0u8; stack_len]);
        let mut r = ByteReader::new(&out);
        assert!(EventParser::for_block(3, false).parse(&mut r).is_err());
    }

    #[test]
    fn malformed_varint_aborts_the_event() {
        let mut block = vec![FLAG_METADATA_ID];
        block.extend_from_slice(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80]);
        let mut r = ByteReader::new(&block);
        let mut parser = EventParser::for_block(4, true);
        assert!(matches!(
            parser.parse(&mut r),
            Err(crate::DecodeError::Format(FormatError::MalformedVarInt(_)))
        ));
    }

    #[test]
    fn oversized_event_is_rejected() {
        let header = sample_header();
        let mut bytes = encode_v4_uncompressed(&header, &[]);
        // Rewrite the size field to blow past the cap.
        bytes[..4].copy_from_slice(&(0x30000i32).to_le_bytes());
        let mut r = ByteReader::new(&bytes);
        assert!(EventParser::for_block(4, false).parse(&mut r).is_err());
    }
}
