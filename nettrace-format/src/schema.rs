use tracing::debug;

use crate::reader::ByteReader;
use crate::types::{
    EventDescriptor, FieldOffset, FieldSize, FieldType, ParameterFetch, PayloadFetch,
};
use crate::{provider, FormatError, Result};

const MAX_FIELD_COUNT: i32 = 0x4000;

/// Tagged extensions trailing the parameter schema.
const TAG_OPCODE: u8 = 1;
const TAG_PARAMETER_PAYLOAD_V2: u8 = 2;

const OPCODE_START: u8 = 1;
const OPCODE_STOP: u8 = 2;

/// Field entry layout within a parameter schema. V1 writes the type
/// signature first; V2 length-prefixes each entry and writes the name first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldLayout {
    V1,
    V2,
}

/// Parse a metadata event payload into a registered descriptor.
///
/// An unsupported type code inside the parameter schema is contained: the
/// descriptor is returned with an empty parameter list and decoding of the
/// trace continues. All other failures are fatal for the metadata event.
pub fn parse_event_metadata(payload: &[u8]) -> Result<EventDescriptor> {
    let mut r = ByteReader::new(payload);

    let metadata_id = r.read_i32()? as u32;
    let provider_name = r.read_utf16_nul()?;
    let event_id = r.read_i32()? as u16;
    let event_name = r.read_utf16_nul()?;
    let keywords = r.read_i64()? as u64;
    let event_version = r.read_i32()? as u8;
    let level = r.read_i32()? as u8;
    debug_assert!(level <= 5, "event level {} out of range", level);

    let mut opcode = 0u8;
    let mut contains_parameter_metadata = false;
    let mut parameters = Vec::new();

    if !r.is_empty() {
        match parse_parameter_schema(&mut r, FieldLayout::V1) {
            Ok(fields) => {
                contains_parameter_metadata = true;
                parameters = fields;
            }
            Err(FormatError::UnsupportedTypeCode(code)) => {
                // The schema cannot be skipped reliably once an unknown code
                // appears, so the rest of the blob (tags included) is dropped
                // with it.
                debug!(metadata_id, code, "discarding parameter schema with unsupported type code");
                let end = payload.len();
                r.set_position(end)?;
            }
            Err(err) => return Err(err),
        }
    }

    while !r.is_empty() {
        let tag_length = r.read_i32()?;
        if tag_length < 0 {
            return Err(FormatError::InvalidFormat("negative metadata tag length"));
        }
        let tag = r.read_u8()?;
        let tag_bytes = r.read_bytes(tag_length as usize)?;
        match tag {
            TAG_OPCODE => {
                if tag_bytes.is_empty() {
                    return Err(FormatError::InvalidFormat("empty opcode tag"));
                }
                opcode = tag_bytes[0];
            }
            TAG_PARAMETER_PAYLOAD_V2 => {
                let mut tr = ByteReader::new(tag_bytes);
                match parse_parameter_schema(&mut tr, FieldLayout::V2) {
                    Ok(fields) => {
                        contains_parameter_metadata = true;
                        parameters = fields;
                    }
                    Err(FormatError::UnsupportedTypeCode(code)) => {
                        debug!(metadata_id, code, "discarding V2 parameter schema with unsupported type code");
                        contains_parameter_metadata = false;
                        parameters = Vec::new();
                    }
                    Err(err) => return Err(err),
                }
            }
            other => {
                debug!(metadata_id, tag = other, "skipping unknown metadata tag");
            }
        }
    }

    let raw_name = event_name;
    let mut event_name = (!raw_name.is_empty()).then(|| raw_name.clone());
    if !raw_name.is_empty() {
        if let Some(known) = diagnostic_source_schema(&provider_name, &raw_name) {
            // Well-known events keep their full names; only the opcode is
            // derived from the suffix.
            contains_parameter_metadata = true;
            parameters = known;
            if opcode == 0 {
                if let Some((_, derived)) = split_opcode_suffix(&raw_name) {
                    opcode = derived;
                }
            }
        } else if opcode == 0 {
            if let Some((canonical, derived)) = split_opcode_suffix(&raw_name) {
                opcode = derived;
                event_name = (!canonical.is_empty()).then_some(canonical);
            }
        }
    }

    let provider_id = provider::provider_guid_from_name(&provider_name);

    Ok(EventDescriptor {
        metadata_id,
        provider_name,
        provider_id,
        event_id,
        event_name,
        keywords,
        event_version,
        level,
        opcode,
        contains_parameter_metadata,
        parameters,
    })
}

/// Derive Start/Stop opcodes from the event name suffix, case-insensitively.
/// Returns the canonical name with the suffix stripped.
fn split_opcode_suffix(name: &str) -> Option<(String, u8)> {
    for (suffix, opcode) in [("start", OPCODE_START), ("stop", OPCODE_STOP)] {
        if name.len() < suffix.len() {
            continue;
        }
        let split = name.len() - suffix.len();
        if name.is_char_boundary(split) && name[split..].eq_ignore_ascii_case(suffix) {
            return Some((name[..split].to_string(), opcode));
        }
    }
    None
}

fn parse_parameter_schema(r: &mut ByteReader<'_>, layout: FieldLayout) -> Result<Vec<ParameterFetch>> {
    let field_count = r.read_i32()?;
    if !(0..MAX_FIELD_COUNT).contains(&field_count) {
        return Err(FormatError::InvalidFormat("parameter field count out of range"));
    }

    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(parse_field(r, layout)?);
    }
    compute_offsets(&mut fields);
    Ok(fields)
}

fn parse_field(r: &mut ByteReader<'_>, layout: FieldLayout) -> Result<ParameterFetch> {
    match layout {
        FieldLayout::V1 => {
            let fetch = parse_type(r, layout)?;
            let name = r.read_utf16_nul()?;
            Ok(ParameterFetch { name, fetch })
        }
        FieldLayout::V2 => {
            let start = r.position();
            let length = r.read_i32()?;
            if length < 4 {
                return Err(FormatError::InvalidFormat("V2 field length too small"));
            }
            let name = r.read_utf16_nul()?;
            let fetch = parse_type(r, layout)?;
            // The entry length covers itself; skip whatever future revisions
            // append after the type signature.
            let end = start + length as usize;
            if r.position() > end {
                return Err(FormatError::InvalidFormat("V2 field overran its declared length"));
            }
            r.set_position(end)?;
            Ok(ParameterFetch { name, fetch })
        }
    }
}

/// Recursively decode one type signature into a payload fetch.
fn parse_type(r: &mut ByteReader<'_>, layout: FieldLayout) -> Result<PayloadFetch> {
    let code = r.read_u32()?;
    let (ty, size) = match code {
        1 => {
            // Struct: a nested field list in the enclosing layout.
            let field_count = r.read_i32()?;
            if !(0..MAX_FIELD_COUNT).contains(&field_count) {
                return Err(FormatError::InvalidFormat("struct field count out of range"));
            }
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                fields.push(parse_field(r, layout)?);
            }
            let size = fixed_extent(&fields)
                .map(FieldSize::Fixed)
                .unwrap_or(FieldSize::Variable);
            compute_offsets(&mut fields);
            (FieldType::Struct(fields), size)
        }
        3 => (FieldType::Bool, FieldSize::Fixed(4)),
        4 => (FieldType::Char, FieldSize::Fixed(2)),
        5 => (FieldType::Int8, FieldSize::Fixed(1)),
        6 => (FieldType::UInt8, FieldSize::Fixed(1)),
        7 => (FieldType::Int16, FieldSize::Fixed(2)),
        8 => (FieldType::UInt16, FieldSize::Fixed(2)),
        9 => (FieldType::Int32, FieldSize::Fixed(4)),
        10 => (FieldType::UInt32, FieldSize::Fixed(4)),
        11 => (FieldType::Int64, FieldSize::Fixed(8)),
        12 => (FieldType::UInt64, FieldSize::Fixed(8)),
        13 => (FieldType::Float32, FieldSize::Fixed(4)),
        14 => (FieldType::Float64, FieldSize::Fixed(8)),
        15 => (FieldType::Decimal, FieldSize::Fixed(16)),
        16 => (FieldType::DateTime, FieldSize::Fixed(8)),
        17 => (FieldType::Guid, FieldSize::Fixed(16)),
        18 => (FieldType::String, FieldSize::NulTerminatedString),
        19 => {
            let elem = parse_type(r, layout)?;
            (FieldType::Array(Box::new(elem)), FieldSize::CountedArray)
        }
        other => return Err(FormatError::UnsupportedTypeCode(other)),
    };
    Ok(PayloadFetch {
        ty,
        size,
        offset: FieldOffset::Runtime,
    })
}

/// Total byte width of a field list when every member is fixed-size.
fn fixed_extent(fields: &[ParameterFetch]) -> Option<u16> {
    let mut total = 0u16;
    for field in fields {
        match field.fetch.size {
            FieldSize::Fixed(size) => total = total.checked_add(size)?,
            _ => return None,
        }
    }
    Some(total)
}

/// Walk the field list assigning offsets. A fixed-size run keeps literal
/// offsets; the first variable-size or composite member forces every
/// subsequent field to runtime resolution.
fn compute_offsets(fields: &mut [ParameterFetch]) {
    let mut offset: Option<u16> = Some(0);
    for field in fields {
        field.fetch.offset = match offset {
            Some(value) => FieldOffset::Fixed(value),
            None => FieldOffset::Runtime,
        };
        offset = match (offset, field.fetch.size) {
            (Some(value), FieldSize::Fixed(size)) => value.checked_add(size),
            _ => None,
        };
        if matches!(field.fetch.ty, FieldType::Struct(_) | FieldType::Array(_)) {
            offset = None;
        }
    }
}

/// Hard-coded schema for the DiagnosticSource forwarder events, which
/// historically shipped without parameter metadata.
fn diagnostic_source_schema(provider_name: &str, event_name: &str) -> Option<Vec<ParameterFetch>> {
    if provider_name != "Microsoft-Diagnostics-DiagnosticSource" {
        return None;
    }
    const KNOWN_EVENTS: &[&str] = &[
        "Event",
        "Activity1Start",
        "Activity1Stop",
        "Activity2Start",
        "Activity2Stop",
        "RecursiveActivity1Start",
        "RecursiveActivity1Stop",
    ];
    if !KNOWN_EVENTS.contains(&event_name) {
        return None;
    }

    let string_fetch = |name: &str| ParameterFetch {
        name: name.to_string(),
        fetch: PayloadFetch {
            ty: FieldType::String,
            size: FieldSize::NulTerminatedString,
            offset: FieldOffset::Runtime,
        },
    };
    let kv_struct = vec![string_fetch("Key"), string_fetch("Value")];
    let mut fields = vec![
        string_fetch("SourceName"),
        string_fetch("EventName"),
        ParameterFetch {
            name: "Arguments".to_string(),
            fetch: PayloadFetch {
                ty: FieldType::Array(Box::new(PayloadFetch {
                    ty: FieldType::Struct(kv_struct),
                    size: FieldSize::Variable,
                    offset: FieldOffset::Runtime,
                })),
                size: FieldSize::CountedArray,
                offset: FieldOffset::Runtime,
            },
        },
    ];
    compute_offsets(&mut fields);
    Some(fields)
}
