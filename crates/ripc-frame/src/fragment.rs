use std::collections::HashMap;

use tracing::debug;

use crate::error::{FrameError, Result};
use crate::pool::{BufferPool, ByteBufferPair};

/// In-progress reassemblies keyed by fragment id.
///
/// Each entry is a pooled pair whose limit is the announced total length;
/// continuation payloads are appended at its cursor and the message is
/// complete when the cursor reaches the limit. There is no last-fragment
/// flag on the wire.
#[derive(Debug, Default)]
pub struct FragmentTable {
    entries: HashMap<u16, ByteBufferPair>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start reassembling `fragment_id` into a buffer of exactly `total_len` bytes.
    ///
    /// A total beyond `max_len` is rejected before anything is allocated. An
    /// unfinished reassembly under the same id is dropped and its buffer
    /// returned to the pool.
    pub fn begin(
        &mut self,
        pool: &BufferPool,
        fragment_id: u16,
        total_len: u64,
        max_len: usize,
    ) -> Result<&mut ByteBufferPair> {
        let len = usize::try_from(total_len)
            .ok()
            .filter(|&len| len <= max_len)
            .ok_or(FrameError::FragmentTooLarge {
                size: total_len,
                max: max_len,
            })?;

        if let Some(stale) = self.entries.remove(&fragment_id) {
            debug!(
                fragment_id,
                received = stale.position(),
                announced = stale.limit(),
                "discarding unfinished reassembly for reused fragment id"
            );
            pool.release(stale);
        }

        let mut pair = pool.acquire(len)?;
        pair.set_limit(len);
        Ok(self.entries.entry(fragment_id).or_insert(pair))
    }

    /// Append a continuation payload. Unknown ids are ignored and yield `Ok(false)`.
    pub fn append(&mut self, fragment_id: u16, data: &[u8]) -> Result<bool> {
        match self.entries.get_mut(&fragment_id) {
            Some(entry) => {
                if entry.try_append(data) {
                    Ok(true)
                } else {
                    Err(FrameError::FragmentOverflow {
                        fragment_id,
                        limit: entry.limit(),
                    })
                }
            }
            None => {
                debug!(fragment_id, "continuation for unknown fragment id dropped");
                Ok(false)
            }
        }
    }

    pub fn get(&self, fragment_id: u16) -> Option<&ByteBufferPair> {
        self.entries.get(&fragment_id)
    }

    pub fn get_mut(&mut self, fragment_id: u16) -> Option<&mut ByteBufferPair> {
        self.entries.get_mut(&fragment_id)
    }

    /// Whether every announced byte of `fragment_id` has arrived.
    pub fn is_complete(&self, fragment_id: u16) -> bool {
        self.entries
            .get(&fragment_id)
            .is_some_and(ByteBufferPair::is_full)
    }

    /// Remove an entry, handing its buffer to the caller.
    pub fn take(&mut self, fragment_id: u16) -> Option<ByteBufferPair> {
        self.entries.remove(&fragment_id)
    }

    /// Return every buffer to `pool` and empty the table.
    pub fn clear(&mut self, pool: &BufferPool) {
        for (_, pair) in self.entries.drain() {
            pool.release(pair);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
