use thiserror::Error;

pub mod payload;
pub mod provider;
pub mod reader;
pub mod schema;
pub mod types;

pub use payload::{PayloadValue, PayloadView};
pub use provider::provider_guid_from_name;
pub use reader::ByteReader;
pub use types::{
    EventDescriptor, EventHeader, FieldOffset, FieldSize, FieldType, Guid, ParameterFetch,
    PayloadFetch, TraceParameters,
};

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("stream ended inside a declared structure (needed {needed} bytes, had {available})")]
    Truncated { needed: usize, available: usize },

    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    #[error("varint continuation exceeded the {0}-byte cap")]
    MalformedVarInt(usize),

    #[error("unsupported parameter type code {0}")]
    UnsupportedTypeCode(u32),
}

pub type Result<T> = std::result::Result<T, FormatError>;
