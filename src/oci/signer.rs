//! OCI API request signing.
//!
//! Requests are authenticated with an HTTP `Signature` authorization header:
//! an RSA-SHA256 signature over a canonical list of headers. Bodies are
//! covered through their SHA-256 digest. Credentials come from a profile in
//! the standard `~/.oci/config` file.

use std::collections::BTreeMap;
use std::env;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Location of the OCI CLI configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "~/.oci/config";
/// Profile read when none is requested.
pub const DEFAULT_PROFILE: &str = "DEFAULT";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors raised while loading credentials or signing a request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SignerError {
    /// Raised when a file cannot be read.
    #[error("reading {path}: {message}")]
    Read {
        /// File path.
        path: Utf8PathBuf,
        /// I/O error text.
        message: String,
    },
    /// Raised when the profile section is absent.
    #[error("profile [{profile}] not found in {path}")]
    MissingProfile {
        /// Requested profile.
        profile: String,
        /// Configuration file.
        path: Utf8PathBuf,
    },
    /// Raised when a required key is absent from the profile.
    #[error("profile [{profile}] is missing {key}")]
    MissingKey {
        /// Requested profile.
        profile: String,
        /// Missing key name.
        key: &'static str,
    },
    /// Raised when the private key is not a PKCS#1 or PKCS#8 RSA key.
    #[error("parsing private key {path}: {message}")]
    Key {
        /// Key file path.
        path: Utf8PathBuf,
        /// Decoder error text.
        message: String,
    },
    /// Raised when the signature cannot be produced.
    #[error("signing request: {0}")]
    Sign(String),
}

/// One profile of the OCI configuration file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OciProfile {
    /// User OCID.
    pub user: String,
    /// Fingerprint of the uploaded public key.
    pub fingerprint: String,
    /// Tenancy OCID.
    pub tenancy: String,
    /// Region identifier, for example `us-sanjose-1`.
    pub region: String,
    /// PEM private key path, with `~` expanded.
    pub key_file: Utf8PathBuf,
}

impl OciProfile {
    /// Reads `profile` from the configuration file at `path` (`~` is
    /// expanded).
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] when the file cannot be read or the profile is
    /// incomplete.
    pub fn load(path: &str, profile: &str) -> Result<Self, SignerError> {
        let resolved = expand_home(path);
        let contents = read_file(&resolved)?;
        Self::parse(&contents, profile, &resolved)
    }

    /// Parses `profile` out of INI-formatted `contents`. Keys missing from
    /// the profile fall back to the `DEFAULT` section.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::MissingProfile`] or [`SignerError::MissingKey`].
    pub fn parse(contents: &str, profile: &str, source: &Utf8Path) -> Result<Self, SignerError> {
        let sections = parse_sections(contents);
        let selected = sections
            .get(profile)
            .ok_or_else(|| SignerError::MissingProfile {
                profile: profile.to_owned(),
                path: source.to_path_buf(),
            })?;
        let defaults = sections.get(DEFAULT_PROFILE);
        let lookup = |key: &'static str| {
            selected
                .get(key)
                .or_else(|| defaults.and_then(|section| section.get(key)))
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| SignerError::MissingKey {
                    profile: profile.to_owned(),
                    key,
                })
        };

        Ok(Self {
            user: lookup("user")?,
            fingerprint: lookup("fingerprint")?,
            tenancy: lookup("tenancy")?,
            region: lookup("region")?,
            key_file: expand_home(&lookup("key_file")?),
        })
    }

    /// Key identifier carried in the authorization header.
    #[must_use]
    pub fn key_id(&self) -> String {
        format!("{}/{}/{}", self.tenancy, self.user, self.fingerprint)
    }
}

fn parse_sections(contents: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current = String::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            name.trim().clone_into(&mut current);
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    sections
}

fn expand_home(path: &str) -> Utf8PathBuf {
    match (path.strip_prefix("~/"), env::var("HOME")) {
        (Some(rest), Ok(home)) => Utf8PathBuf::from(home).join(rest),
        _ => Utf8PathBuf::from(path),
    }
}

fn read_file(path: &Utf8Path) -> Result<String, SignerError> {
    let read_error = |message: String| SignerError::Read {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    dir.read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))
}

/// Request parts covered by the signature.
#[derive(Clone, Copy, Debug)]
pub struct SigningInput<'a> {
    /// HTTP method, any case.
    pub method: &'a str,
    /// `Host` header value.
    pub host: &'a str,
    /// Absolute path including the query string.
    pub path_and_query: &'a str,
    /// `Date` header value in RFC 7231 form.
    pub date: &'a str,
    /// Request body; `Some` for methods that carry one, even when empty.
    pub body: Option<&'a [u8]>,
}

/// Headers to attach to a signed request, in signing order.
pub type SignedHeaders = Vec<(&'static str, String)>;

fn signed_headers(input: &SigningInput<'_>) -> SignedHeaders {
    let mut headers = vec![
        ("date", input.date.to_owned()),
        (
            "(request-target)",
            format!(
                "{} {}",
                input.method.to_ascii_lowercase(),
                input.path_and_query
            ),
        ),
        ("host", input.host.to_owned()),
    ];
    if let Some(body) = input.body {
        headers.push(("content-length", body.len().to_string()));
        headers.push(("content-type", String::from(JSON_CONTENT_TYPE)));
        headers.push(("x-content-sha256", STANDARD.encode(Sha256::digest(body))));
    }
    headers
}

fn signing_string(headers: &SignedHeaders) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Signs requests with one API key.
pub struct RequestSigner {
    key_id: String,
    key: SigningKey<Sha256>,
}

impl RequestSigner {
    /// Loads the private key named by `profile`.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] when the key file cannot be read or parsed.
    pub fn from_profile(profile: &OciProfile) -> Result<Self, SignerError> {
        let pem = read_file(&profile.key_file)?;
        Self::from_pem(profile.key_id(), &pem, &profile.key_file)
    }

    /// Builds a signer from a PEM-encoded PKCS#8 or PKCS#1 RSA key.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Key`] when the key cannot be decoded.
    pub fn from_pem(key_id: String, pem: &str, source: &Utf8Path) -> Result<Self, SignerError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|err| SignerError::Key {
                path: source.to_path_buf(),
                message: err.to_string(),
            })?;
        Ok(Self::from_key(key_id, private))
    }

    /// Wraps an already decoded key.
    #[must_use]
    pub fn from_key(key_id: String, key: RsaPrivateKey) -> Self {
        Self {
            key_id,
            key: SigningKey::<Sha256>::new(key),
        }
    }

    /// Returns the headers to send, ending with `authorization`. The `host`
    /// and `(request-target)` entries are signed but not returned.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Sign`] when the RSA operation fails.
    pub fn sign(&self, input: &SigningInput<'_>) -> Result<SignedHeaders, SignerError> {
        let headers = signed_headers(input);
        let signature = self
            .key
            .try_sign(signing_string(&headers).as_bytes())
            .map_err(|err| SignerError::Sign(err.to_string()))?;
        let names = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" ");
        let authorization = format!(
            "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{names}\",signature=\"{}\"",
            self.key_id,
            STANDARD.encode(signature.to_bytes())
        );

        let mut outgoing: SignedHeaders = headers
            .into_iter()
            .filter(|(name, _)| !matches!(*name, "host" | "(request-target)"))
            .collect();
        outgoing.push(("authorization", authorization));
        Ok(outgoing)
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
