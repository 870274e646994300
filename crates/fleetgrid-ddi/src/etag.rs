//! Response validators.

use sha2::{Digest, Sha256};

/// Accumulates the state a response depends on into an opaque tag.
#[derive(Default)]
pub struct ETagBuilder {
    hasher: Sha256,
}

impl ETagBuilder {
    pub fn new(kind: &str) -> Self {
        let mut builder = Self::default();
        builder.hasher.update(kind.as_bytes());
        builder
    }

    /// Mix in one named part; `Debug` output is stable for the types used.
    pub fn part(mut self, name: &str, value: impl std::fmt::Debug) -> Self {
        self.hasher.update([0u8]);
        self.hasher.update(name.as_bytes());
        self.hasher.update([b'=']);
        self.hasher.update(format!("{value:?}").as_bytes());
        self
    }

    /// Hex digest, truncated to 32 characters.
    pub fn finish(self) -> String {
        let mut digest = hex::encode(self.hasher.finalize());
        digest.truncate(32);
        digest
    }
}
