//! itsdangerous-compatible signed values, as used for Flask session cookies.
//!
//! A signed value is `.` + urlsafe-base64(zlib(payload)) + `.` +
//! urlsafe-base64(HMAC-SHA1(key, value)), with `key = HMAC-SHA1(secret, salt)`.
//! Base64 is unpadded. A value without the leading `.` is taken as
//! uncompressed.

use std::io::{Read, Write};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

pub const DEFAULT_SALT: &str = "itsdangerous.Signer";
const SEP: char = '.';

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no separator found in value")]
    NoSeparator,
    #[error("signature does not match")]
    BadSignature,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid payload: {0}")]
    Payload(#[from] std::io::Error),
}

/// Signs and verifies values with a salt-derived HMAC-SHA1 key.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl Signer {
    pub fn new(secret: &str, salt: &str) -> Self {
        let salt = if salt.is_empty() { DEFAULT_SALT } else { salt };
        Self {
            key: hmac_sha1(secret.as_bytes(), salt.as_bytes()),
        }
    }

    /// Compress and sign `payload`.
    pub fn sign(&self, payload: &[u8]) -> Result<String, SignerError> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload)?;
        let compressed = enc.finish()?;
        let value = format!("{SEP}{}", URL_SAFE_NO_PAD.encode(compressed));
        let sig = URL_SAFE_NO_PAD.encode(hmac_sha1(&self.key, value.as_bytes()));
        Ok(format!("{value}{SEP}{sig}"))
    }

    /// Verify the signature and return the decoded payload.
    pub fn unsign(&self, signed: &str) -> Result<Vec<u8>, SignerError> {
        let (value, sig) = signed.rsplit_once(SEP).ok_or(SignerError::NoSeparator)?;
        let sig = URL_SAFE_NO_PAD.decode(sig)?;

        let mut mac =
            HmacSha1::new_from_slice(&self.key).map_err(|_| SignerError::BadSignature)?;
        mac.update(value.as_bytes());
        mac.verify_slice(&sig).map_err(|_| SignerError::BadSignature)?;

        let compressed = value.starts_with(SEP);
        // A timed serializer appends `.timestamp`; only the first segment is payload.
        let body = value
            .trim_start_matches(SEP)
            .split(SEP)
            .next()
            .unwrap_or_default();
        let raw = URL_SAFE_NO_PAD.decode(body)?;
        if !compressed {
            return Ok(raw);
        }
        let mut out = Vec::new();
        ZlibDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_unsign() {
        let s = Signer::new("secret", "cookie-session");
        let payload = br#"{"uid":7,"acl":{"userName":"alice","parentRoles":["admin"]}}"#;
        let signed = s.sign(payload).unwrap();
        assert!(signed.starts_with('.'));
        assert_eq!(s.unsign(&signed).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload() {
        let s = Signer::new("k", "");
        let signed = s.sign(b"").unwrap();
        assert_eq!(s.unsign(&signed).unwrap(), b"");
    }

    #[test]
    fn test_tampered_value_rejected() {
        let s = Signer::new("secret", "cookie-session");
        let signed = s.sign(b"{\"uid\":1}").unwrap();

        let (value, sig) = signed.rsplit_once('.').unwrap();
        let mut bytes = value.as_bytes().to_vec();
        let i = bytes.len() - 1;
        bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
        let tampered = format!("{}.{sig}", String::from_utf8(bytes).unwrap());
        assert!(matches!(
            s.unsign(&tampered),
            Err(SignerError::BadSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_or_salt() {
        let signed = Signer::new("a", "x").sign(b"1").unwrap();
        assert!(Signer::new("b", "x").unsign(&signed).is_err());
        assert!(Signer::new("a", "y").unsign(&signed).is_err());
    }

    #[test]
    fn test_no_separator() {
        let s = Signer::new("a", "");
        assert!(matches!(s.unsign("abc"), Err(SignerError::NoSeparator)));
    }

    #[test]
    fn test_uncompressed_value() {
        let s = Signer::new("secret", "");
        let value = URL_SAFE_NO_PAD.encode(b"{\"a\":1}");
        let sig = URL_SAFE_NO_PAD.encode(hmac_sha1(&s.key, value.as_bytes()));
        assert_eq!(s.unsign(&format!("{value}.{sig}")).unwrap(), b"{\"a\":1}");
    }
}
