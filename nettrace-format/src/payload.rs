use crate::reader::ByteReader;
use crate::types::{EventDescriptor, FieldType, Guid, ParameterFetch, PayloadFetch};
use crate::Result;

/// One decoded payload field value.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Bool(bool),
    Char(char),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    /// Raw 96-bit scaled decimal, surfaced as stored.
    Decimal([u8; 16]),
    /// Raw tick count, surfaced as stored.
    DateTime(i64),
    Guid(Guid),
    String(String),
    Struct(Vec<(String, PayloadValue)>),
    Array(Vec<PayloadValue>),
}

/// Decoded view over an event payload, driven by the descriptor's fetch
/// list. Fields are resolved by a sequential walk, which also covers every
/// offset the schema marked as runtime-resolved.
pub struct PayloadView<'a> {
    descriptor: &'a EventDescriptor,
    bytes: &'a [u8],
}

impl<'a> PayloadView<'a> {
    pub fn new(descriptor: &'a EventDescriptor, bytes: &'a [u8]) -> Self {
        PayloadView { descriptor, bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.parameters.is_empty()
    }

    /// Decode every field. A payload shorter than its schema yields the
    /// fields that fit; decoding never panics on malformed input.
    pub fn values(&self) -> Vec<(String, PayloadValue)> {
        let mut r = ByteReader::new(self.bytes);
        let mut out = Vec::with_capacity(self.descriptor.parameters.len());
        for param in &self.descriptor.parameters {
            match read_value(&mut r, &param.fetch) {
                Ok(value) => out.push((param.name.clone(), value)),
                Err(_) => break,
            }
        }
        out
    }
}

fn read_fields(r: &mut ByteReader<'_>, fields: &[ParameterFetch]) -> Result<Vec<(String, PayloadValue)>> {
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        out.push((field.name.clone(), read_value(r, &field.fetch)?));
    }
    Ok(out)
}

fn read_value(r: &mut ByteReader<'_>, fetch: &PayloadFetch) -> Result<PayloadValue> {
    let value = match &fetch.ty {
        FieldType::Bool => PayloadValue::Bool(r.read_i32()? != 0),
        FieldType::Char => {
            let unit = r.read_u16()?;
            PayloadValue::Char(char::from_u32(u32::from(unit)).unwrap_or('\u{fffd}'))
        }
        FieldType::Int8 => PayloadValue::Int8(r.read_u8()? as i8),
        FieldType::UInt8 => PayloadValue::UInt8(r.read_u8()?),
        FieldType::Int16 => PayloadValue::Int16(r.read_i16()?),
        FieldType::UInt16 => PayloadValue::UInt16(r.read_u16()?),
        FieldType::Int32 => PayloadValue::Int32(r.read_i32()?),
        FieldType::UInt32 => PayloadValue::UInt32(r.read_u32()?),
        FieldType::Int64 => PayloadValue::Int64(r.read_i64()?),
        FieldType::UInt64 => PayloadValue::UInt64(r.read_u64()?),
        FieldType::Float32 => PayloadValue::Float32(r.read_f32()?),
        FieldType::Float64 => PayloadValue::Float64(r.read_f64()?),
        FieldType::Decimal => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(r.read_bytes(16)?);
            PayloadValue::Decimal(raw)
        }
        FieldType::DateTime => PayloadValue::DateTime(r.read_i64()?),
        FieldType::Guid => PayloadValue::Guid(r.read_guid()?),
        FieldType::String => PayloadValue::String(r.read_utf16_nul()?),
        FieldType::Struct(fields) => PayloadValue::Struct(read_fields(r, fields)?),
        FieldType::Array(elem) => {
            let count = r.read_u16()?;
            let mut values = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                values.push(read_value(r, elem)?);
            }
            PayloadValue::Array(values)
        }
    };
    Ok(value)
}
