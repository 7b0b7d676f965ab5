//! Cache keys
//!
//! A key is a fixed-size plain-old-data value derived from pipeline state.
//! Its raw bytes are what the disk cache stores, so key layouts must not
//! contain padding (enforced by `bytemuck::Pod`).

use bytemuck::Pod;
use sha1::{Digest, Sha1};
use std::fmt::Debug;
use std::hash::Hash;

/// Fixed-size opaque key for one shader variant
pub trait CacheKey: Pod + Eq + Hash + Debug + Send + Sync + 'static {
    /// Size of the key on disk
    const SIZE: usize = std::mem::size_of::<Self>();

    /// Reject keys that no key deriver could have produced (reserved bits set,
    /// out-of-range enums). Used to spot corrupt disk records.
    fn is_valid(&self) -> bool {
        true
    }

    fn to_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let key: Self = bytemuck::try_pod_read_unaligned(bytes).ok()?;
        key.is_valid().then_some(key)
    }
}

/// Hash RSX program microcode into the 64-bit identity used by keys
pub fn program_hash(ucode: &[u32]) -> u64 {
    let mut hasher = Sha1::new();
    for word in ucode {
        hasher.update(word.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Split a 64-bit hash into the `[u32; 2]` form stored in keys
pub(crate) fn split_hash(hash: u64) -> [u32; 2] {
    [hash as u32, (hash >> 32) as u32]
}

/// Inverse of `split_hash`
pub(crate) fn join_hash(parts: [u32; 2]) -> u64 {
    (parts[0] as u64) | ((parts[1] as u64) << 32)
}
