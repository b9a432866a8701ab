//! Salted password hashes
//!
//! Passwords are stretched with PBKDF2-HMAC-SHA256 under a random 16-byte
//! salt. The stored form records everything verification needs:
//!
//! ```text
//! pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>
//! ```
//!
//! Hashing is CPU bound; handlers run it on the blocking thread pool.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::types::LoyaltyError;

/// Iteration count for new hashes
pub const DEFAULT_ITERATIONS: u32 = 600_000;

const SCHEME: &str = "pbkdf2-sha256";

type HmacSha256 = Hmac<Sha256>;

/// Hashes and verifies user passwords
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHasher {
    iterations: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl PasswordHasher {
    /// # Returns
    ///
    /// * `Err(LoyaltyError::Config)` if `iterations` is zero
    pub fn new(iterations: u32) -> Result<Self, LoyaltyError> {
        if iterations == 0 {
            return Err(LoyaltyError::config("password iterations must be positive"));
        }
        Ok(Self { iterations })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Hash `password` under a fresh salt
    pub fn hash(&self, password: &str) -> Result<String, LoyaltyError> {
        let salt = Uuid::new_v4().into_bytes();
        let derived = pbkdf2_sha256(password.as_bytes(), &salt, self.iterations)?;
        Ok(format!(
            "{}${}${}${}",
            SCHEME,
            self.iterations,
            hex::encode(salt),
            hex::encode(derived)
        ))
    }

    /// Check `password` against a stored hash
    ///
    /// The iteration count comes from the stored hash, so raising the default
    /// keeps older hashes valid. Malformed hashes never verify.
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        let Some((iterations, salt, expected)) = parse(stored) else {
            return false;
        };
        match pbkdf2_sha256(password.as_bytes(), &salt, iterations) {
            Ok(derived) => constant_time_eq(&derived, &expected),
            Err(_) => false,
        }
    }
}

fn parse(stored: &str) -> Option<(u32, Vec<u8>, Vec<u8>)> {
    let mut parts = stored.split('$');
    if parts.next()? != SCHEME {
        return None;
    }
    let iterations: u32 = parts.next()?.parse().ok().filter(|n| *n > 0)?;
    let salt = hex::decode(parts.next()?).ok()?;
    let hash = hex::decode(parts.next()?).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((iterations, salt, hash))
}

/// PBKDF2 with HMAC-SHA256, one 32-byte output block
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], LoyaltyError> {
    let prf = <HmacSha256 as Mac>::new_from_slice(password)
        .map_err(|e| LoyaltyError::argument(format!("unusable password: {}", e)))?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut block = [0u8; 32];
    block.copy_from_slice(&mac.finalize().into_bytes());
    let mut derived = block;

    for _ in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&block);
        block.copy_from_slice(&mac.finalize().into_bytes());
        derived
            .iter_mut()
            .zip(block.iter())
            .for_each(|(out, byte)| *out ^= byte);
    }
    Ok(derived)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
