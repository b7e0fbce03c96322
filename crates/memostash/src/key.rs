use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::serialize::Serializer;

/// Width of one shard directory level, in bits.
///
/// Two levels of 14 bits keep every directory below 16384 entries, the
/// point where per-file read latency starts to degrade on common
/// filesystems (existence checks hold up until roughly 65536). With both
/// levels fanned out, caches of a few hundred million entries stay under
/// the knee.
const SHARD_BITS: u32 = 14;

const SHARD_MASK: u32 = (1 << SHARD_BITS) - 1;

/// Identifies one canonicalized call.
///
/// A `CacheKey` is the SHA-256 digest of the stable metadata it was built
/// from; equality and hashing consider only the digest. The metadata is
/// kept around because it is invaluable when debugging why two calls did
/// or did not share an entry.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Returns the human-readable metadata that forms the basis of this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the raw digest bytes.
    pub fn digest(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Returns the sharded relative path for this key.
    ///
    /// The path has the form `s1/s2/rest`: the first 28 bits of the digest
    /// are split into two 14-bit shard segments, each formatted as four
    /// lowercase hex digits, and the remaining 228 bits become the
    /// filename.
    pub fn relative_path(&self) -> String {
        let lead = u32::from_be_bytes([self.hash[0], self.hash[1], self.hash[2], self.hash[3]]);
        let s1 = (lead >> 18) & SHARD_MASK;
        let s2 = (lead >> 4) & SHARD_MASK;
        let mut path = format!("{s1:04x}/{s2:04x}/{:01x}", lead & 0xf);
        for b in &self.hash[4..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }

    #[cfg(test)]
    pub(crate) fn for_testing(seed: &str) -> Self {
        KeyBuilder::new(seed).build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the
/// intention of it is to accept human readable, but most importantly
/// **stable**, input: the registered identity of the wrapped function or
/// type, followed by one line per argument. This input is then hashed to
/// form the [`CacheKey`], and travels alongside the key for diagnostics.
pub struct KeyBuilder {
    metadata: String,
}

impl KeyBuilder {
    /// Starts a key for the given registered identity.
    pub fn new(scope: &str) -> Self {
        let metadata = format!("scope: {scope}\n\n");
        Self { metadata }
    }

    /// Folds one call argument into the key.
    ///
    /// Writes the argument name, the concrete type of the value and the
    /// hex of its serialized bytes. Including the type means distinct
    /// representations of the "same" value (an integer and a float, a
    /// vector and a tuple) can never collide.
    pub fn write_arg<T, S>(&mut self, name: &str, value: &T, serializer: &S) -> Result<()>
    where
        T: Serialize,
        S: Serializer,
    {
        let bytes = serializer.serialize(value)?;
        writeln!(
            self.metadata,
            "{name} ({}): {}",
            std::any::type_name::<T>(),
            hex::encode(bytes)
        )
        .unwrap();
        Ok(())
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for KeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
pub(crate) fn safe_path_segment(s: &str) -> String {
    s.replace(['.', '/', '\\', ':'], "_")
}
