//! SMTP authentication helpers
//!
//! Credential decoding for AUTH PLAIN and AUTH LOGIN, and the argon2
//! hashing used for room submission passwords.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::warn;

/// Decoded login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Decode an AUTH PLAIN response.
///
/// PLAIN format: base64(\0username\0password) or base64(authzid\0authcid\0password)
pub fn decode_plain(credentials: &str) -> Option<Credentials> {
    let decoded = match BASE64.decode(credentials.trim()) {
        Ok(d) => d,
        Err(e) => {
            warn!("AUTH PLAIN: Invalid base64: {}", e);
            return None;
        }
    };

    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
    let (username, password) = match parts.len() {
        2 => (parts[0], parts[1]),
        // authzid is ignored, the authcid is the login
        3 => (parts[1], parts[2]),
        _ => {
            warn!("AUTH PLAIN: Invalid credential format, got {} parts", parts.len());
            return None;
        }
    };

    let username = String::from_utf8_lossy(username).trim().to_string();
    if username.is_empty() {
        return None;
    }
    Some(Credentials {
        username,
        password: String::from_utf8_lossy(password).to_string(),
    })
}

/// Decode one base64 line of an AUTH LOGIN exchange
pub fn decode_login(value: &str) -> Option<String> {
    match BASE64.decode(value.trim()) {
        Ok(d) => Some(String::from_utf8_lossy(&d).to_string()),
        Err(e) => {
            warn!("AUTH LOGIN: Invalid base64: {}", e);
            None
        }
    }
}

/// Hash a submission password with a fresh salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("Failed to hash password: {}", e))
}

/// Verify a password against an argon2 hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow!("Invalid password hash format: {}", e))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(_) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow!("Password verification error: {}", e)),
    }
}

/// Generate base64 encoded challenge for AUTH LOGIN
pub fn login_challenge_username() -> String {
    BASE64.encode(b"Username:")
}

/// Generate base64 encoded challenge for AUTH LOGIN
pub fn login_challenge_password() -> String {
    BASE64.encode(b"Password:")
}
