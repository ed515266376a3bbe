use std::collections::HashMap;

use nettrace_format::{ByteReader, FormatError};
use tracing::debug;

use crate::Result;

/// Interned stack blobs, addressed by the ids event headers carry.
///
/// Entries live from their StackBlock until the next sequence point (or the
/// end of the trace); a lookup miss means the stack aged out and is not an
/// error.
#[derive(Debug, Default)]
pub struct StackCache {
    stacks: HashMap<u32, Vec<u8>>,
}

impl StackCache {
    pub fn new() -> Self {
        StackCache::default()
    }

    /// Decode a StackBlock body: first id, count, then length-prefixed
    /// blobs registered at consecutive ids.
    pub fn process_stack_block(&mut self, contents: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(contents);
        let first_id = r.read_i32()?;
        let count = r.read_i32()?;
        if first_id < 0 || count < 0 {
            return Err(FormatError::InvalidFormat("negative stack block counts").into());
        }
        for i in 0..count as u32 {
            let length = r.read_i32()?;
            if length < 0 {
                return Err(FormatError::InvalidFormat("negative stack length").into());
            }
            let bytes = r.read_bytes(length as usize)?;
            self.stacks.insert(first_id as u32 + i, bytes.to_vec());
        }
        Ok(())
    }

    pub fn get(&self, stack_id: u32) -> Option<&[u8]> {
        self.stacks.get(&stack_id).map(Vec::as_slice)
    }

    /// Sequence points retire every interned stack.
    pub fn flush(&mut self) {
        debug!(retired = self.stacks.len(), "flushing stack cache");
        self.stacks.clear();
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_block(first_id: i32, stacks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&first_id.to_le_bytes());
        out.extend_from_slice(&(stacks.len() as i32).to_le_bytes());
        for stack in stacks {
            out.extend_from_slice(&(stack.len() as i32).to_le_bytes());
            out.extend_from_slice(stack);
        }
        out
    }

    #[test]
    fn stacks_register_at_consecutive_ids() {
        let mut cache = StackCache::new();
        cache
            .process_stack_block(&stack_block(3, &[&[1, 1], &[], &[2, 2, 2]]))
            .unwrap();
        assert_eq!(cache.get(3), Some(&[1u8, 1][..]));
        assert_eq!(cache.get(4), Some(&[][..]));
        assert_eq!(cache.get(5), Some(&[2u8, 2, 2][..]));
        assert_eq!(cache.get(6), None);
    }

    #[test]
    fn absent_lookup_is_not_an_error() {
        let cache = StackCache::new();
        assert_eq!(cache.get(42), None);
    }

    #[test]
    fn flush_retires_everything() {
        let mut cache = StackCache::new();
        cache.process_stack_block(&stack_block(1, &[&[9]])).unwrap();
        assert!(!cache.is_empty());
        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn truncated_block_is_an_error() {
        let mut cache = StackCache::new();
        let mut bytes = stack_block(1, &[&[1, 2, 3]]);
        bytes.truncate(bytes.len() - 2);
        assert!(cache.process_stack_block(&bytes).is_err());
    }
}
