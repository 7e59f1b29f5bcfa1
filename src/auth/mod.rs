//! Shared-secret authentication for the admin surface
//!
//! Operators present the secret in the `x-admin-secret` header. Only the
//! SHA-256 digest of the configured secret is kept in memory, and presented
//! values are compared digest to digest.
//!
//! # Configuration
//!
//! - `ADMIN_SECRET`: required; the admin routes refuse to start without it

mod middleware;

pub use middleware::*;

use sha2::{Digest, Sha256};

use crate::infra::{Result, SyncError};

/// Header carrying the admin secret
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing x-admin-secret header")]
    MissingSecret,

    #[error("invalid admin secret")]
    InvalidSecret,
}

/// The configured admin secret, held as a digest
#[derive(Clone)]
pub struct AdminSecret {
    digest: [u8; 32],
}

impl std::fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSecret").finish_non_exhaustive()
    }
}

impl AdminSecret {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(SyncError::Configuration(
                "ADMIN_SECRET must not be empty".to_string(),
            ));
        }
        Ok(Self {
            digest: Self::hash(secret),
        })
    }

    /// Hex digest, as written to logs at startup
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.digest[..4])
    }

    fn hash(value: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hasher.finalize().into()
    }

    /// Check a presented header value
    pub fn verify(&self, presented: Option<&str>) -> std::result::Result<(), AuthError> {
        let presented = presented
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingSecret)?;

        let candidate = Self::hash(presented);
        let diff = candidate
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));

        if diff == 0 {
            Ok(())
        } else {
            Err(AuthError::InvalidSecret)
        }
    }
}
