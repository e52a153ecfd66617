// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// String fields are length-prefixed with a two byte integer, so 65535 bytes
/// is the hard limit for every one of them.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// More than 65535 bytes.
    TooLong,

    /// Ill-formed UTF-8 or an embedded NUL character.
    InvalidChar,
}

/// Check `s` is usable as an MQTT string field.
///
/// The character data must be well-formed UTF-8 and must not include
/// an encoding of the null character U+0000 [MQTT-1.5.3-2].
///
/// # Errors
///
/// Returns error if `s` is too long or contains NUL.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > MAX_STRING_LEN {
        return Err(StringError::TooLong);
    }
    if s.contains('\0') {
        return Err(StringError::InvalidChar);
    }
    Ok(())
}

/// Convert raw bytes from a packet into a validated string field.
///
/// # Errors
///
/// Returns error if `bytes` is not well-formed UTF-8 or contains NUL.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_err| StringError::InvalidChar)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// More than 65535 bytes.
    TooLong,

    /// Contains bytes outside printable ASCII (0x20..=0x7e).
    InvalidChars,
}

/// Check `client_id` is acceptable in a connect packet.
///
/// An empty client id is permitted, the broker will assign one. A non-empty
/// id must consist of printable ASCII only.
///
/// # Errors
///
/// Returns error if `client_id` is too long or contains invalid characters.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > MAX_STRING_LEN {
        return Err(ClientIdError::TooLong);
    }
    if !client_id.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

/// Generate a random alphanumeric string, used as client id when the
/// application does not provide one.
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("topic/level").is_ok());
        assert!(validate_utf8_string("").is_ok());
        assert_eq!(
            validate_utf8_string("bad\0topic"),
            Err(StringError::InvalidChar)
        );
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("").is_ok());
        assert!(validate_client_id("test-client-23").is_ok());
        assert_eq!(
            validate_client_id("caf\u{e9}"),
            Err(ClientIdError::InvalidChars)
        );
        assert_eq!(
            validate_client_id("tab\tid"),
            Err(ClientIdError::InvalidChars)
        );
    }

    #[test]
    fn test_random_string() {
        let s = random_string(12);
        assert_eq!(s.len(), 12);
        assert!(validate_client_id(&s).is_ok());
    }
}
