//! Keys of a [`DiskHashMap`](crate::DiskHashMap).

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over `data`.
#[must_use]
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A key that can be stored in a bucket.
///
/// Every key of a type serializes to exactly [`SERIALIZED_SIZE`] bytes.
/// The 32-bit [`bucket_hash`](BucketKey::bucket_hash) picks the bucket and
/// is stored next to the key so most probes never decode the key bytes.
///
/// [`SERIALIZED_SIZE`]: BucketKey::SERIALIZED_SIZE
pub trait BucketKey: Clone + Eq + Send + Sync {
    const SERIALIZED_SIZE: usize;

    /// Writes the key into `out`, which is `SERIALIZED_SIZE` bytes long.
    fn serialize(&self, out: &mut [u8]);

    /// Reads a key from `bytes`, which is `SERIALIZED_SIZE` bytes long.
    fn deserialize(bytes: &[u8]) -> Self;

    /// FNV-1a of the serialized form unless overridden.
    fn bucket_hash(&self) -> u32 {
        let mut buf = vec![0u8; Self::SERIALIZED_SIZE];
        self.serialize(&mut buf);
        fnv1a_32(&buf)
    }
}

impl BucketKey for u64 {
    const SERIALIZED_SIZE: usize = 8;

    fn serialize(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(buf)
    }

    fn bucket_hash(&self) -> u32 {
        fnv1a_32(&self.to_le_bytes())
    }
}

/// Fixed-size byte keys such as account addresses (`[u8; 20]`) or digests
/// (`[u8; 32]`).
impl<const N: usize> BucketKey for [u8; N] {
    const SERIALIZED_SIZE: usize = N;

    fn serialize(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let mut key = [0u8; N];
        key.copy_from_slice(&bytes[..N]);
        key
    }

    fn bucket_hash(&self) -> u32 {
        fnv1a_32(self)
    }
}
