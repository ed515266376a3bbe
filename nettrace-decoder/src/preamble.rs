use std::io::Read;

use chrono::{TimeZone, Utc};
use nettrace_format::{FormatError, TraceParameters};

use crate::stream::StreamReader;
use crate::Result;

/// Serialization stream tags.
pub const TAG_NULL_REFERENCE: u8 = 1;
pub const TAG_FORWARD_REFERENCE: u8 = 3;
pub const TAG_BEGIN_OBJECT: u8 = 4;
pub const TAG_BEGIN_PRIVATE_OBJECT: u8 = 5;
pub const TAG_END_OBJECT: u8 = 6;

/// Eight-byte magic prefixing V4+ files.
pub const NETTRACE_MAGIC: &[u8; 8] = b"Nettrace";

const SERIALIZATION_HEADER: &str = "!FastSerialization.1";

/// Serialized object header: the object's type name and versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub name: String,
    pub version: i32,
    pub min_reader_version: i32,
}

/// Probe for the Nettrace magic without committing the cursor.
pub fn probe_magic<R: Read>(reader: &mut StreamReader<R>) -> Result<bool> {
    match reader.peek(NETTRACE_MAGIC.len()) {
        Ok(head) if head == NETTRACE_MAGIC => {
            reader.skip(NETTRACE_MAGIC.len() as u64)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        // A stream shorter than the magic can still be a (bad) legacy file;
        // let the serialization header report the real problem.
        Err(_) => Ok(false),
    }
}

/// The stream begins with a counted "!FastSerialization.1" string.
pub fn read_serialization_header<R: Read>(reader: &mut StreamReader<R>) -> Result<()> {
    let header = reader.read_counted_utf8()?;
    if header != SERIALIZATION_HEADER {
        return Err(FormatError::InvalidFormat("missing serialization stream header").into());
    }
    Ok(())
}

fn expect_tag<R: Read>(reader: &mut StreamReader<R>, tag: u8, what: &'static str) -> Result<()> {
    if reader.read_u8()? != tag {
        return Err(FormatError::InvalidFormat(what).into());
    }
    Ok(())
}

/// Read the next object header, or `None` at the null-object end marker.
pub fn read_object_header<R: Read>(reader: &mut StreamReader<R>) -> Result<Option<ObjectHeader>> {
    let tag = reader.read_u8()?;
    match tag {
        TAG_NULL_REFERENCE => Ok(None),
        TAG_BEGIN_OBJECT | TAG_BEGIN_PRIVATE_OBJECT => {
            expect_tag(reader, TAG_BEGIN_PRIVATE_OBJECT, "object type must be private")?;
            expect_tag(reader, TAG_NULL_REFERENCE, "type of type must be a null reference")?;
            let version = reader.read_i32()?;
            let min_reader_version = reader.read_i32()?;
            let name = reader.read_counted_utf8()?;
            expect_tag(reader, TAG_END_OBJECT, "unterminated type object")?;
            Ok(Some(ObjectHeader {
                name,
                version,
                min_reader_version,
            }))
        }
        _ => Err(FormatError::InvalidFormat("unexpected serialization tag").into()),
    }
}

pub fn expect_end_object<R: Read>(reader: &mut StreamReader<R>) -> Result<()> {
    expect_tag(reader, TAG_END_OBJECT, "unterminated object")
}

/// V1/V2 streams place a forward reference to the end of the event stream
/// right after the entry object. The referenced table lives at the end of
/// the file, which a pure stream cannot visit; the flat event loop runs to
/// end of stream instead, so only the slot is consumed here.
pub fn skip_forward_reference<R: Read>(reader: &mut StreamReader<R>) -> Result<()> {
    if reader.peek(1)?[0] == TAG_FORWARD_REFERENCE {
        reader.read_u8()?;
        reader.read_i32()?;
    }
    Ok(())
}

/// Decode the `Trace` entry object body into trace-wide parameters.
///
/// The object-header version of the entry is the file format version and
/// governs which trailing fields are present.
pub fn read_trace_parameters<R: Read>(
    reader: &mut StreamReader<R>,
    file_format_version: u32,
) -> Result<TraceParameters> {
    let year = reader.read_u16()?;
    let month = reader.read_u16()?;
    let _day_of_week = reader.read_u16()?;
    let day = reader.read_u16()?;
    let hour = reader.read_u16()?;
    let minute = reader.read_u16()?;
    let second = reader.read_u16()?;
    let millisecond = reader.read_u16()?;
    let sync_time_qpc = reader.read_u64()?;
    let qpc_frequency = reader.read_u64()?;

    let sync_time_utc = Utc
        .with_ymd_and_hms(
            i32::from(year),
            u32::from(month),
            u32::from(day),
            u32::from(hour),
            u32::from(minute),
            u32::from(second),
        )
        .single()
        .ok_or(FormatError::InvalidFormat("sync time out of range"))?
        + chrono::Duration::milliseconds(i64::from(millisecond));

    let (pointer_size, process_id, processor_count, expected_cpu_sampling_rate);
    if file_format_version >= 3 {
        pointer_size = reader.read_u32()?;
        process_id = reader.read_u32()?;
        processor_count = reader.read_u32()?;
        expected_cpu_sampling_rate = reader.read_u32()?;
    } else {
        pointer_size = 8;
        process_id = 0;
        processor_count = 1;
        expected_cpu_sampling_rate = 0;
    }

    if pointer_size != 4 && pointer_size != 8 {
        return Err(FormatError::InvalidFormat("pointer size must be 4 or 8").into());
    }

    Ok(TraceParameters {
        sync_time_utc,
        sync_time_qpc,
        qpc_frequency,
        pointer_size,
        process_id,
        processor_count,
        expected_cpu_sampling_rate,
        file_format_version,
    })
}
