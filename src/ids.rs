//! Opaque identifiers: connection ids and monotonic id generation.
//!
//! Grounded on `UUID.h` (opaque unique identifier, exposed only as a
//! string) and `BCryptHash.h` (fixed-width digest) from the original
//! implementation, reworked onto `uuid`/`sha2` instead of the Win32
//! RPC/BCrypt APIs the original called into.

use sha2::{Digest, Sha256};

/// A 128-bit connection identifier. Opaque to every caller except the
/// dispatcher that minted it; rendered as its canonical string form on
/// the wire and in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The empty id marks a free session slot.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-width password digest. The column type is named `password`
/// in table definitions but the stored value is a 32-byte SHA-256
/// digest, never the plaintext.
pub const DIGEST_WIDTH: usize = 32;

pub fn digest_password(plaintext: &str) -> [u8; DIGEST_WIDTH] {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hasher.finalize().into()
}

/// A trait for types that can be produced by a monotonic counter.
/// Implemented only for the fixed-width integers this engine actually
/// uses as ids (transaction ids are `i16`).
pub trait Sequential: Copy {
    fn succ(self) -> Self;
}

macro_rules! impl_sequential {
    ($($t:ty),*) => {
        $(impl Sequential for $t {
            fn succ(self) -> Self {
                self.wrapping_add(1)
            }
        })*
    };
}

impl_sequential!(i16, i32, i64, u32, u64);

/// Monotonic id allocator starting from an arbitrary seed.
///
/// `IdGenerator::new(0).next()` yields `0, 1, 2, ...`;
/// `IdGenerator::new(10).next()` yields `10, 11, 12, ...`.
#[derive(Debug, Clone)]
pub struct IdGenerator<T> {
    next: T,
}

impl<T: Sequential> IdGenerator<T> {
    pub fn new(start: T) -> Self {
        Self { next: start }
    }

    pub fn next(&mut self) -> T {
        let id = self.next;
        self.next = self.next.succ();
        id
    }
}
