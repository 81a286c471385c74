use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `taskmill`, this serves two primary purposes:
/// 1. It identifies build nodes: the id of a node is a hash over its rule
///    kind, arguments and dependency ids, so two identical tag expressions
///    collapse into one node.
/// 2. It fingerprints node inputs to decide whether a cached artifact is
///    still valid. Fingerprints are computed from file *contents*, never
///    modification times, because task trees are routinely fresh checkouts
///    with meaningless timestamps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes as a big-endian integer, used to derive stable
    /// generator seeds.
    pub(crate) fn prefix_u32(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Incremental hasher over a sequence of byte parts. Each part is
/// length-prefixed so that `["ab", "c"]` and `["a", "bc"]` never collide.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn push(&mut self, part: impl AsRef<[u8]>) -> &mut Self {
        let part = part.as_ref();
        self.0.update(&(part.len() as u64).to_le_bytes());
        self.0.update(part);
        self
    }

    pub(crate) fn finish(self) -> Hash32 {
        let bytes: [u8; 32] = self.0.finalize().into();
        Hash32::from(bytes)
    }
}

/// Deterministic identity of a build node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) Hash32);

impl NodeId {
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }

    /// Shortened hex form used in generated file names.
    pub(crate) fn short(self) -> String {
        let mut hex = self.0.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_renders_every_byte() {
        let hash = Hash32::hash(b"taskmill");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(Hash32::hash(b"abc"), Hash32::hash(b"abc"));
        assert_ne!(Hash32::hash(b"abc"), Hash32::hash(b"abd"));
    }

    #[test]
    fn parts_are_length_prefixed() {
        let mut a = Blake3Hasher::default();
        a.push("ab").push("c");
        let mut b = Blake3Hasher::default();
        b.push("a").push("bc");
        assert_ne!(a.finish(), b.finish());
    }
}
