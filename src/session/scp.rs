//! Single-file push over `scp -t`.
//!
//! The sender writes a control line `C<mode> <size> <name>\n`, the raw bytes
//! and a terminating NUL. The sink answers each stage with a status byte:
//! `0` for success, `1` for a warning and `2` for a fatal error, the latter
//! two followed by a message line.

use thiserror::Error;

/// Acknowledgements expected from the sink: start, control line, data.
const EXPECTED_ACKS: usize = 3;

/// Errors raised while preparing or verifying a push.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScpError {
    /// Raised when the mode is not four octal digits.
    #[error("invalid file mode {0:?}: expected four octal digits")]
    InvalidMode(String),
    /// Raised when the file name cannot be sent in a control line.
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    /// Raised when the sink reports a warning or error.
    #[error("remote scp rejected the transfer: {0}")]
    Rejected(String),
    /// Raised when the sink stops before acknowledging every stage.
    #[error("remote scp acknowledged {received} of {expected} stages")]
    Incomplete {
        /// Acknowledgements received.
        received: usize,
        /// Acknowledgements required.
        expected: usize,
    },
}

/// Builds the byte stream written to the sink's standard input.
///
/// # Errors
///
/// Returns [`ScpError`] when `mode` or `name` cannot be encoded.
pub fn payload(mode: &str, name: &str, contents: &[u8]) -> Result<Vec<u8>, ScpError> {
    let valid_mode = mode.len() == 4 && mode.chars().all(|ch| ('0'..='7').contains(&ch));
    if !valid_mode {
        return Err(ScpError::InvalidMode(mode.to_owned()));
    }
    if name.is_empty() || name.contains(['/', '\n', '\r', '\0']) {
        return Err(ScpError::InvalidName(name.to_owned()));
    }

    let header = format!("C{mode} {} {name}\n", contents.len());
    let mut bytes = Vec::with_capacity(header.len() + contents.len() + 1);
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(contents);
    bytes.push(0);
    Ok(bytes)
}

/// Checks the sink's responses for one pushed file.
///
/// # Errors
///
/// Returns [`ScpError::Rejected`] when a warning or error byte appears and
/// [`ScpError::Incomplete`] when fewer acknowledgements than expected arrive.
pub fn verify_acks(response: &[u8]) -> Result<(), ScpError> {
    let mut received = 0;
    let mut rest = response;
    while let Some((&status, tail)) = rest.split_first() {
        if status == 0 {
            received += 1;
            rest = tail;
            continue;
        }
        // Unknown status bytes are echoed back as part of the message.
        let message = if matches!(status, 1 | 2) { tail } else { rest };
        let line = message.split(|byte| *byte == b'\n').next().unwrap_or_default();
        return Err(ScpError::Rejected(
            String::from_utf8_lossy(line).trim().to_owned(),
        ));
    }

    if received < EXPECTED_ACKS {
        return Err(ScpError::Incomplete {
            received,
            expected: EXPECTED_ACKS,
        });
    }
    Ok(())
}
