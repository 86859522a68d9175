//! Tube identifiers: the 8-byte opaque key that demultiplexes packets.

use std::hash::{BuildHasherDefault, Hasher};

use rand::RngCore;

use crate::error::{Error, Result};

/// Number of bytes in a tube identifier.
pub const TUBE_ID_SIZE: usize = 8;

/// An opaque 8-byte tube identifier.
///
/// Equality is bytewise; ordering is not meaningful and intentionally not
/// implemented, matching the "ordering is not required" language in the
/// data model.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TubeId(pub [u8; TUBE_ID_SIZE]);

impl TubeId {
    pub fn from_bytes(bytes: [u8; TUBE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TUBE_ID_SIZE] {
        &self.0
    }

    /// 16 lowercase hex characters, e.g. `0102030405060708`.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(TUBE_ID_SIZE * 2);
        for byte in &self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

}

impl std::fmt::Debug for TubeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TubeId({})", self.to_hex())
    }
}

/// Source of cryptographic-quality random bytes for fresh tube ids.
///
/// Abstracted behind a trait so the testable property in the spec ("two
/// consecutive calls never produce equal identifiers in testing with a
/// deterministic RNG seed") can be exercised with a seeded, injected source
/// instead of reaching for real entropy.
pub trait IdSource {
    /// Fill `dest` with random bytes, failing if the source is exhausted or
    /// otherwise cannot produce entropy.
    fn fill(&mut self, dest: &mut [u8]) -> Result<()>;
}

/// The default id source: the OS cryptographic RNG.
#[derive(Default)]
pub struct OsIdSource;

impl IdSource for OsIdSource {
    fn fill(&mut self, dest: &mut [u8]) -> Result<()> {
        rand::rngs::OsRng
            .try_fill_bytes(dest)
            .map_err(|_| Error::NoEntropy)
    }
}

/// Draw a fresh tube id from the OS RNG.
pub fn new_id() -> Result<TubeId> {
    new_id_from(&mut OsIdSource)
}

/// Draw a fresh tube id from an arbitrary [`IdSource`]; used in tests with a
/// deterministic seeded source.
pub fn new_id_from(source: &mut dyn IdSource) -> Result<TubeId> {
    let mut bytes = [0u8; TUBE_ID_SIZE];
    source.fill(&mut bytes)?;
    Ok(TubeId(bytes))
}

/// `BuildHasher` for the tube table that mixes the identifier's 64 bits the
/// same way the original C hash table did (a 64-bit avalanche mix), rather
/// than the default SipHash. Collision resistance doesn't matter here (ids
/// are already uniformly random); bit-compatibility with the documented
/// "computed from the identifier's 64 bits" invariant does.
#[derive(Default)]
pub struct TubeIdHasher(u64);

impl Hasher for TubeIdHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        // TubeId's Hash impl always writes exactly 8 bytes (the derive on a
        // `[u8; 8]` newtype does this in one call).
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        let mut key = u64::from_ne_bytes(buf);

        key = (!key).wrapping_add(key << 18);
        key ^= key >> 31;
        key = key.wrapping_mul(21);
        key ^= key >> 11;
        key = key.wrapping_add(key << 6);
        key ^= key >> 22;
        self.0 = key;
    }
}

/// `BuildHasherDefault` alias for use in `HashMap<TubeId, _, TubeIdBuildHasher>`.
pub type TubeIdBuildHasher = BuildHasherDefault<TubeIdHasher>;

#[cfg(test)]
mod tests {
    use std::hash::Hash;

    use super::*;

    struct SeededSource {
        state: u64,
    }

    impl IdSource for SeededSource {
        fn fill(&mut self, dest: &mut [u8]) -> Result<()> {
            for byte in dest.iter_mut() {
                self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
                *byte = (self.state >> 33) as u8;
            }
            Ok(())
        }
    }

    #[test]
    fn consecutive_ids_differ_with_seeded_source() {
        let mut source = SeededSource { state: 42 };
        let a = new_id_from(&mut source).unwrap();
        let b = new_id_from(&mut source).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn to_hex_is_lowercase_and_fixed_width() {
        let id = TubeId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(id.to_hex(), "0102030405060708");
    }

    #[test]
    fn equality_is_bytewise() {
        let a = TubeId::from_bytes([0; 8]);
        let b = TubeId::from_bytes([0; 8]);
        let c = TubeId::from_bytes([1; 8]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hasher_is_deterministic_for_equal_ids() {
        use std::hash::{BuildHasher, Hasher as _};
        let id = TubeId::from_bytes([9, 8, 7, 6, 5, 4, 3, 2]);
        let build = TubeIdBuildHasher::default();
        let mut h1 = build.build_hasher();
        let mut h2 = build.build_hasher();
        id.hash(&mut h1);
        id.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }
}
