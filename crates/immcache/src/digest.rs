use std::fmt;
use std::io;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The keyed checksum of a cached value.
///
/// This is an HMAC-SHA256 over the content, keyed with the integrity secret of the cache. It is
/// used both as the address of the content on disk and to verify it when reading it back.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The digest as lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incrementally computes a [`Digest`].
#[derive(Clone)]
pub(crate) struct Hasher(HmacSha256);

impl Hasher {
    /// Creates an accumulator keyed with `secret`.
    pub fn new(secret: &[u8]) -> io::Result<Self> {
        HmacSha256::new_from_slice(secret)
            .map(Self)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid integrity secret"))
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> Digest {
        Digest(self.0.finalize().into_bytes().into())
    }

    /// Checks the accumulated content against `expected` in constant time.
    pub fn verify(self, expected: &Digest) -> bool {
        self.0.verify_slice(expected.as_bytes()).is_ok()
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}
