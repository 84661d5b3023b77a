//! Token minting.
//!
//! All tokens are URL-safe base64 over OS randomness, single-purpose, and
//! scoped to their subject row. The trait exists so tests can substitute a
//! deterministic sequence.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Check-in confirmation tokens: 32 random bytes.
pub const CHECK_IN_TOKEN_BYTES: usize = 32;
/// Trustee access tokens: 48 random bytes.
pub const ACCESS_TOKEN_BYTES: usize = 48;

pub trait TokenGenerator: Send + Sync {
    /// Mint a URL-safe token over `bytes` bytes of entropy.
    fn mint(&self, bytes: usize) -> String;
}

/// Production generator backed by the OS CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureTokens;

impl TokenGenerator for SecureTokens {
    fn mint(&self, bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        OsRng.fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_url_safe_and_distinct() {
        let gen = SecureTokens;
        let a = gen.mint(CHECK_IN_TOKEN_BYTES);
        let b = gen.mint(CHECK_IN_TOKEN_BYTES);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 32 bytes -> 43 base64 chars unpadded.
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn access_tokens_are_longer_than_check_in_tokens() {
        let gen = SecureTokens;
        let access = gen.mint(ACCESS_TOKEN_BYTES);
        let check_in = gen.mint(CHECK_IN_TOKEN_BYTES);
        assert!(access.len() > check_in.len());
    }
}
