use std::collections::HashMap;

use nettrace_format::{schema, EventDescriptor, FormatError};
use tracing::debug;

use crate::Result;

/// Mapping from metadata id to event descriptor, owned for the whole trace.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    descriptors: HashMap<u32, EventDescriptor>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        MetadataRegistry::default()
    }

    /// Parse a metadata event payload and register the resulting descriptor,
    /// returning its id.
    ///
    /// Ids are assigned by the emitter starting from 1; the blob's own id
    /// must be usable as a key. Re-registration replaces the descriptor,
    /// which emitters use for rundown refreshes.
    pub fn register_blob(&mut self, payload: &[u8]) -> Result<u32> {
        let descriptor = schema::parse_event_metadata(payload)?;
        if descriptor.metadata_id == 0 {
            return Err(FormatError::InvalidFormat("metadata blob with reserved id 0").into());
        }
        debug!(
            metadata_id = descriptor.metadata_id,
            provider = %descriptor.provider_name,
            event = descriptor.event_name.as_deref().unwrap_or(""),
            "registered event descriptor"
        );
        let id = descriptor.metadata_id;
        self.descriptors.insert(id, descriptor);
        Ok(id)
    }

    pub fn get(&self, metadata_id: u32) -> Option<&EventDescriptor> {
        self.descriptors.get(&metadata_id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
