//! Queue images used to seed a new Secondary.
//!
//! Frame layout: `u32 length (LE) | msgpack body | u32 crc32 (LE)`.

use crate::error::{QueueError, Result};
use crate::types::{MemberId, QueueEvent};
use serde::{Deserialize, Serialize};

/// Sanity bound for a single image body.
const MAX_IMAGE_BYTES: usize = 256 * 1024 * 1024;

/// Snapshot of one replica's entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueImage {
    pub subscription: u64,
    pub source: MemberId,
    pub events: Vec<QueueEvent>,
}

impl QueueImage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(self)?;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);

        let checksum = crc32fast::hash(&encoded);
        frame.extend_from_slice(&checksum.to_le_bytes());

        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 8 {
            return Err(QueueError::Corruption("queue image truncated".into()));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&frame[..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_IMAGE_BYTES {
            return Err(QueueError::Corruption("queue image too large".into()));
        }
        if frame.len() != len + 8 {
            return Err(QueueError::Corruption(format!(
                "queue image length mismatch: header says {}, frame holds {}",
                len,
                frame.len().saturating_sub(8)
            )));
        }

        let encoded = &frame[4..4 + len];
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&frame[4 + len..]);
        let stored = u32::from_le_bytes(checksum_bytes);

        let computed = crc32fast::hash(encoded);
        if stored != computed {
            return Err(QueueError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(encoded)?)
    }
}
