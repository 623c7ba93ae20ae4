use crate::Error;

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;

/// The HMAC key a session signs its messages with.
///
/// Long-term credentials carry a digest of `username:realm:password`,
/// short-term credentials use the password bytes directly. The variant
/// also selects the integrity attribute: `Md5` and `Raw` keys sign with
/// MESSAGE-INTEGRITY (HMAC-SHA1), `Sha256` keys with
/// MESSAGE-INTEGRITY-SHA256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Password {
    Md5([u8; 16]),
    Sha256([u8; 32]),
    Raw(Vec<u8>),
}

impl Password {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Md5(it) => it,
            Self::Sha256(it) => it,
            Self::Raw(it) => it,
        }
    }
}

/// The digest algorithm used to derive a long-term credential key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordAlgorithm {
    Md5,
    Sha256,
}

/// HMAC SHA1 digest.
///
/// # Test
///
/// ```
/// use turn_relay_codec::crypto::hmac_sha1;
///
/// let buffer = [
///     0x00u8, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
///     0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19, 0x00,
///     0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70, 0x61, 0x6e,
///     0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09, 0x72, 0x61, 0x73,
///     0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00, 0x00, 0x00, 0x15, 0x00,
///     0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32, 0x62, 0x32, 0x34, 0x35, 0x62,
///     0x33, 0x61, 0x37, 0x33, 0x34,
/// ];
///
/// let key = [
///     0x3eu8, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff,
///     0x2f, 0x59, 0xb5, 0x0f, 0xd1,
/// ];
///
/// let sign = [
///     0xd6u8, 0x78, 0x26, 0x99, 0x0e, 0x15, 0x56, 0x15, 0xe5, 0xf4, 0x24,
///     0x74, 0xe2, 0x3c, 0x26, 0xc5, 0xb1, 0x03, 0xb2, 0x6d,
/// ];
///
/// assert_eq!(&hmac_sha1(&key, &[&buffer]).unwrap(), &sign);
/// ```
pub fn hmac_sha1(key: &[u8], source: &[&[u8]]) -> Result<[u8; 20], Error> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| Error::SummaryFailed)?;
    for buf in source {
        mac.update(buf);
    }

    Ok(mac.finalize().into_bytes().into())
}

/// HMAC SHA256 digest.
pub fn hmac_sha256(key: &[u8], source: &[&[u8]]) -> Result<[u8; 32], Error> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| Error::SummaryFailed)?;
    for buf in source {
        mac.update(buf);
    }

    Ok(mac.finalize().into_bytes().into())
}

/// CRC32 Fingerprint.
///
/// # Test
///
/// ```
/// use turn_relay_codec::crypto::fingerprint;
///
/// assert_eq!(fingerprint(b"1"), 3498621689);
/// ```
pub fn fingerprint(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes) ^ 0x5354_554e
}

/// create long term credential.
///
/// > key = MD5(username ":" OpaqueString(realm) ":" OpaqueString(password))
///
/// # Test
///
/// ```
/// use turn_relay_codec::crypto::long_term_credential_digest;
///
/// let buffer = [
///     0x3eu8, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff,
///     0x2f, 0x59, 0xb5, 0x0f, 0xd1,
/// ];
///
/// let key = long_term_credential_digest("panda", "raspberry", "panda");
///
/// assert_eq!(key, buffer);
/// ```
pub fn long_term_credential_digest(username: &str, password: &str, realm: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update([username, realm, password].join(":"));
    hasher.finalize().into()
}

/// create long term credential for sha256.
///
/// > key = SHA256(username ":" OpaqueString(realm) ":" OpaqueString(password))
pub fn long_term_credential_digest_sha256(
    username: &str,
    password: &str,
    realm: &str,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([username, realm, password].join(":"));
    hasher.finalize().into()
}

/// Derive a long-term credential key with the given algorithm.
///
/// # Test
///
/// ```
/// use turn_relay_codec::crypto::*;
///
/// let password = generate_password("panda", "raspberry", "panda", PasswordAlgorithm::Md5);
/// assert!(matches!(password, Password::Md5(_)));
/// ```
pub fn generate_password(
    username: &str,
    password: &str,
    realm: &str,
    algorithm: PasswordAlgorithm,
) -> Password {
    match algorithm {
        PasswordAlgorithm::Md5 => {
            Password::Md5(long_term_credential_digest(username, password, realm))
        }
        PasswordAlgorithm::Sha256 => {
            Password::Sha256(long_term_credential_digest_sha256(username, password, realm))
        }
    }
}

/// The TURN REST API password for a timed username.
///
/// > password = base64(hmac(shared_secret, username))
///
/// The username carries a unix timestamp, so the password expires with
/// it and no per-user state is stored on the server.
///
/// # Test
///
/// ```
/// use turn_relay_codec::crypto::rest_api_password;
///
/// let a = rest_api_password("secret", "1700000000:caller");
/// let b = rest_api_password("secret", "1700000000:caller");
/// let c = rest_api_password("other", "1700000000:caller");
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
pub fn rest_api_password(shared_secret: &str, username: &str) -> String {
    let digest = hmac_sha1(shared_secret.as_bytes(), &[username.as_bytes()])
        .expect("hmac accepts keys of any size");

    STANDARD.encode(digest)
}
