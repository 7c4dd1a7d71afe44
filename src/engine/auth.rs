//! Challenge-Response Authenticator
//!
//! Proves that a peer holds the pre-shared secret before any update traffic
//! is accepted. The device issues a random nonce; the peer answers with
//! HMAC-SHA-256(secret, nonce).

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::sync::OnceLock;
use tracing::{error, info, warn};

use crate::engine::error::AuthError;

/// Upper bound on the pre-shared secret length in bytes
pub const MAX_SECRET_LEN: usize = 48;

/// Default challenge length in bytes
pub const NONCE_LEN: usize = 16;

/// HMAC-SHA-256 output length in bytes
pub const MAC_LEN: usize = 32;

pub type Nonce = [u8; NONCE_LEN];

/// Source of cryptographically secure random bytes
pub trait EntropySource: Send + Sync {
    fn fill(&self, buffer: &mut [u8]);
}

/// Operating-system RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}

/// Keyed MAC used to check challenge responses
pub trait ResponseMac: Send + Sync {
    /// Compute the expected response for `nonce`
    fn compute(&self, key: &[u8], nonce: &[u8]) -> [u8; MAC_LEN];

    /// Check `tag` against the expected response in constant time
    fn verify(&self, key: &[u8], nonce: &[u8], tag: &[u8]) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha256;

impl ResponseMac for HmacSha256 {
    fn compute(&self, key: &[u8], nonce: &[u8]) -> [u8; MAC_LEN] {
        // HMAC accepts keys of any length
        let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return [0u8; MAC_LEN],
        };
        mac.update(nonce);
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn verify(&self, key: &[u8], nonce: &[u8], tag: &[u8]) -> bool {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key) else {
            error!("HMAC key setup failed");
            return false;
        };
        mac.update(nonce);
        mac.verify_slice(tag).is_ok()
    }
}

/// Compute a challenge response for a peer holding `secret`
pub fn respond(secret: &[u8], nonce: &[u8]) -> [u8; MAC_LEN] {
    HmacSha256.compute(secret, nonce)
}

/// Pre-shared key, immutable once provisioned
#[derive(Clone)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(key: &[u8]) -> Result<Self, AuthError> {
        if key.is_empty() || key.len() > MAX_SECRET_LEN {
            return Err(AuthError::InvalidLength(key.len()));
        }
        Ok(Self(key.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret({} bytes)", self.0.len())
    }
}

pub struct Authenticator<R = OsEntropy, M = HmacSha256> {
    secret: OnceLock<SharedSecret>,
    rng: R,
    mac: M,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::with_parts(OsEntropy, HmacSha256)
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: EntropySource, M: ResponseMac> Authenticator<R, M> {
    /// Build an authenticator over explicit entropy and MAC collaborators
    pub fn with_parts(rng: R, mac: M) -> Self {
        Self {
            secret: OnceLock::new(),
            rng,
            mac,
        }
    }

    /// Provision the pre-shared secret. Succeeds at most once.
    pub fn set_secret(&self, key: &[u8]) -> Result<(), AuthError> {
        if self.secret.get().is_some() {
            error!("Shared secret already set");
            return Err(AuthError::AlreadySet);
        }

        let secret = SharedSecret::new(key).inspect_err(|_| {
            error!(len = key.len(), "Shared secret length out of range");
        })?;

        // A concurrent provisioner may have won between the check and here
        self.secret.set(secret).map_err(|_| {
            error!("Shared secret already set");
            AuthError::AlreadySet
        })?;

        info!("Shared secret has been set");
        Ok(())
    }

    pub fn has_secret(&self) -> bool {
        self.secret.get().is_some()
    }

    /// Fill `buffer` with fresh random challenge bytes
    pub fn fill_challenge(&self, buffer: &mut [u8]) {
        self.rng.fill(buffer);
        info!(len = buffer.len(), "Nonce generated");
    }

    /// Allocate a challenge of `len` random bytes
    pub fn generate_challenge(&self, len: usize) -> Vec<u8> {
        let mut nonce = vec![0u8; len];
        self.fill_challenge(&mut nonce);
        nonce
    }

    /// Issue a standard 16-byte nonce
    pub fn issue_nonce(&self) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        self.fill_challenge(&mut nonce);
        nonce
    }

    /// Check a peer's response to `nonce`. Fails closed.
    pub fn verify_response(&self, nonce: &[u8], received_mac: &[u8]) -> bool {
        if received_mac.len() != MAC_LEN {
            warn!(len = received_mac.len(), "Invalid HMAC response length");
            return false;
        }

        let Some(secret) = self.secret.get() else {
            warn!("HMAC verification attempted before provisioning");
            return false;
        };

        let valid = self.mac.verify(secret.as_bytes(), nonce, received_mac);
        if valid {
            info!("HMAC successfully verified");
        } else {
            warn!("Invalid HMAC");
        }
        valid
    }
}
