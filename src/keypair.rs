//! Single-use SSH credentials for one instance.
//!
//! The private half lives only in process memory; it is never serialised or
//! written to disk. The public half is rendered in OpenSSH authorized-keys
//! form for instance metadata.

use std::fmt;
use std::sync::Arc;

use rand::rngs::OsRng;
use russh::keys::PrivateKey;
use russh::keys::ssh_key::{Algorithm, EcdsaCurve};
use thiserror::Error;

use crate::provider::AuthorizedKey;

/// Errors raised while generating an ephemeral key pair.
#[derive(Debug, Error)]
pub enum KeyPairError {
    /// Raised when the random key cannot be generated.
    #[error("generating ssh key: {0}")]
    Generate(String),
    /// Raised when the public key cannot be encoded.
    #[error("encoding ssh public key: {0}")]
    Encode(String),
}

/// Authentication handle passed to the dialer.
#[derive(Clone)]
pub struct SshCredentials {
    /// Login user on the remote host.
    pub user: String,
    /// Private key used for public-key authentication.
    pub key: Arc<PrivateKey>,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// NIST P-384 key pair generated fresh for every run.
pub struct EphemeralKeyPair {
    private: Arc<PrivateKey>,
    public_openssh: String,
}

impl EphemeralKeyPair {
    /// Generates a new key pair from the operating system RNG.
    ///
    /// # Errors
    ///
    /// Returns [`KeyPairError`] when generation or public-key encoding fails.
    pub fn generate() -> Result<Self, KeyPairError> {
        let private = PrivateKey::random(
            &mut OsRng,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP384,
            },
        )
        .map_err(|err| KeyPairError::Generate(err.to_string()))?;
        let public_openssh = private
            .public_key()
            .to_openssh()
            .map_err(|err| KeyPairError::Encode(err.to_string()))?;

        Ok(Self {
            private: Arc::new(private),
            public_openssh,
        })
    }

    /// Returns the public key in OpenSSH authorized-keys form.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_openssh
    }

    /// Builds the metadata entry authorising this key for `user`.
    #[must_use]
    pub fn authorized_key(&self, user: &str) -> AuthorizedKey {
        AuthorizedKey {
            user: user.to_owned(),
            openssh: self.public_openssh.clone(),
        }
    }

    /// Builds the credentials used to authenticate as `user`.
    #[must_use]
    pub fn credentials(&self, user: &str) -> SshCredentials {
        SshCredentials {
            user: user.to_owned(),
            key: Arc::clone(&self.private),
        }
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &self.public_openssh)
            .finish_non_exhaustive()
    }
}
