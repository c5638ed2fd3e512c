//! Segment header keys.
//!
//! Each data file begins with 16 Meta-channel reconstruction headers, one
//! per bucket. Their keys are derived from an MD5 of the host name and the
//! installation path, with the segment index written into bytes 1 and 2
//! and byte 0 searched until the key's checksum nibble hits the slot.
//!
//! With `x` the XOR of the first nine key bytes, key `i` satisfies
//! `((x ^ (x >> 4)) + 1) & 0xF == i`, which places it in bucket
//! `(i + 15) % 16`.

use serde::{Deserialize, Serialize};

use cascette_crypto::{ContentKey, TRUNCATED_KEY_SIZE, TruncatedKey};

use crate::{ContainerError, Result, SEGMENT_KEY_COUNT};

/// How the container is bound to the installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// Container rebuilt from CDN content by this tool
    #[default]
    Reconstruction,
    /// Container owned by a standalone client installation
    Standalone,
}

impl BindMode {
    /// Error code reported when the container is too large
    pub const fn capacity_error_code(self) -> u32 {
        match self {
            Self::Reconstruction => 1,
            Self::Standalone => 9,
        }
    }
}

/// The 16 keys seeded into one data file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKeys {
    /// Segment (data file) index the keys belong to
    pub segment: u16,
    /// Full keys, slot `i` at index `i`
    pub keys: [ContentKey; SEGMENT_KEY_COUNT],
}

impl SegmentKeys {
    /// Truncated keys in slot order
    pub fn truncated(&self) -> [TruncatedKey; SEGMENT_KEY_COUNT] {
        self.keys.map(|key| key.truncated())
    }
}

/// Checksum nibble that places a key in its segment slot
pub fn slot_nibble(key: &[u8]) -> u8 {
    let x = key
        .iter()
        .take(TRUNCATED_KEY_SIZE)
        .fold(0u8, |acc, &b| acc ^ b);
    (x ^ (x >> 4)).wrapping_add(1) & 0x0F
}

/// Derives segment header keys for a container
#[derive(Debug, Clone)]
pub struct SegmentKeyDeriver {
    base_key: ContentKey,
    max_size: u64,
    bind_mode: BindMode,
}

impl SegmentKeyDeriver {
    /// Create a deriver for a host and installation path
    pub fn new(machine_name: &str, base_dir: &str, max_size: u64, bind_mode: BindMode) -> Self {
        Self {
            base_key: ContentKey::from_parts([machine_name.as_bytes(), base_dir.as_bytes()]),
            max_size,
            bind_mode,
        }
    }

    /// MD5 of host name followed by installation path
    pub const fn base_key(&self) -> &ContentKey {
        &self.base_key
    }

    /// Derive the 16 keys for `segment`
    pub fn derive(&self, segment: u16) -> Result<SegmentKeys> {
        let gib = self.max_size >> 30;
        if gib > 0x3FF {
            return Err(ContainerError::ContainerTooLarge {
                code: self.bind_mode.capacity_error_code(),
                max_size: self.max_size,
            });
        }

        let [low, high] = segment.to_le_bytes();
        let mut keys = [ContentKey::default(); SEGMENT_KEY_COUNT];

        for (slot, out) in keys.iter_mut().enumerate() {
            let mut candidate = *self.base_key.as_bytes();
            candidate[1] = low;
            if gib > 256 {
                candidate[2] = high;
            }

            // 255 candidates cover every nibble for any base key
            let found = (0..u8::MAX).find(|&first| {
                candidate[0] = first;
                usize::from(slot_nibble(&candidate)) == slot
            });

            if found.is_none() {
                return Err(ContainerError::SegmentKeySearch {
                    segment,
                    nibble: slot as u8,
                });
            }
            *out = ContentKey::from_bytes(candidate);
        }

        Ok(SegmentKeys { segment, keys })
    }
}
