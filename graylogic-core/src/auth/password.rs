//! Password hashing using Argon2id
//!
//! Argon2id with time=3, memory=64 MiB, parallelism=1, 16-byte salt and
//! 32-byte output. Passwords are capped at 128 characters on every ingress
//! path; verification is constant-time via the PHC machinery.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2PasswordHasher, PasswordVerifier,
        SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::error::{Error, Result};

const MEMORY_COST_KIB: u32 = 64 * 1024;
const TIME_COST: u32 = 3;
const PARALLELISM: u32 = 1;
const OUTPUT_LEN: usize = 32;
const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 128;

/// Password hasher using Argon2id
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(MEMORY_COST_KIB, TIME_COST, PARALLELISM, Some(OUTPUT_LEN))
            .expect("fixed Argon2 parameters are valid");
        Self { params }
    }

    /// Length gate shared by every path that accepts a plaintext password
    pub fn check_length(password: &str) -> Result<()> {
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(Error::Validation(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        if password.len() > MAX_PASSWORD_LENGTH {
            return Err(Error::Validation(format!(
                "password must be at most {MAX_PASSWORD_LENGTH} characters"
            )));
        }
        Ok(())
    }

    /// Hash a password into PHC string format
    pub fn hash(&self, password: &str) -> Result<String> {
        Self::check_length(password)?;
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("password hash: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a stored hash.
    ///
    /// Over-length input is rejected before any hashing work, matching the
    /// ingress cap, and cannot be used to probe the hash.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        if password.len() > MAX_PASSWORD_LENGTH {
            return Ok(false);
        }
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Internal(format!("stored hash invalid: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("password verify: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hasher = PasswordHasher::new();
        let hash = hasher.hash("correct horse battery").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("m=65536,t=3,p=1"));

        assert!(hasher.verify("correct horse battery", &hash).unwrap());
        assert!(!hasher.verify("wrong password", &hash).unwrap());
    }

    #[test]
    fn length_caps_are_enforced() {
        let hasher = PasswordHasher::new();
        assert!(hasher.hash("short").is_err());
        let long = "x".repeat(129);
        assert!(hasher.hash(&long).is_err());
        let max = "x".repeat(128);
        assert!(hasher.hash(&max).is_ok());
    }

    #[test]
    fn oversized_verify_input_fails_closed() {
        let hasher = PasswordHasher::new();
        let hash = hasher.hash("a valid password").unwrap();
        let long = "x".repeat(200);
        assert!(!hasher.verify(&long, &hash).unwrap());
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = PasswordHasher::new();
        let h1 = hasher.hash("same password").unwrap();
        let h2 = hasher.hash("same password").unwrap();
        assert_ne!(h1, h2);
        assert!(hasher.verify("same password", &h1).unwrap());
        assert!(hasher.verify("same password", &h2).unwrap());
    }

    #[test]
    fn invalid_stored_hash_is_internal_error() {
        let hasher = PasswordHasher::new();
        assert!(hasher.verify("whatever", "not-a-phc-string").is_err());
    }
}
