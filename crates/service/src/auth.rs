use std::net::IpAddr;
use std::str::FromStr;

use codec::crypto::{Password, rest_api_password};
use rand::Rng;

/// The credential mechanism the server runs with.
///
/// The four mechanisms are mutually exclusive; the session state
/// machine dispatches integrity verification on the variant.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// All requests accepted without integrity.
    #[default]
    NoAuth,
    /// RFC 5389 10.1: the username names a password used directly as
    /// the HMAC key. No REALM, no NONCE.
    ShortTerm,
    /// RFC 5389 10.2: key = MD5(username ":" realm ":" password), the
    /// server issues REALM and NONCE.
    LongTerm,
    /// The TURN REST API: the username carries a unix timestamp and the
    /// password is derived from a shared secret, so accounts need no
    /// provisioning. Any of the configured secrets may match.
    TimedSecret {
        secrets: Vec<String>,
        /// Separates the timestamp from the user part of the username.
        separator: char,
    },
}

impl Credentials {
    /// Whether the mechanism issues REALM/NONCE challenges.
    pub fn is_long_term(&self) -> bool {
        matches!(self, Self::LongTerm | Self::TimedSecret { .. })
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::NoAuth)
    }
}

/// Derives the long-term key candidates for a REST API username from
/// the shared secrets. The caller verifies the integrity against each
/// candidate in turn, since the expected password is never transmitted.
///
/// The username is `"<unix-timestamp>" [":" <suffix>]`; a timestamp in
/// the past rejects the request outright.
///
/// # Test
///
/// ```
/// use turn_relay_service::auth::timed_secret_candidates;
///
/// let secrets = vec!["old".to_string(), "new".to_string()];
/// let username = format!("{}:caller", u32::MAX);
///
/// assert_eq!(timed_secret_candidates(&secrets, ':', &username, "localhost").unwrap().len(), 2);
/// assert!(timed_secret_candidates(&secrets, ':', "100:caller", "localhost").is_none());
/// assert!(timed_secret_candidates(&secrets, ':', "caller", "localhost").is_none());
/// ```
pub fn timed_secret_candidates(
    secrets: &[String],
    separator: char,
    username: &str,
    realm: &str,
) -> Option<Vec<Password>> {
    let timestamp: u64 = username
        .split_once(separator)
        .map(|(ts, _)| ts)
        .unwrap_or(username)
        .parse()
        .ok()?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();

    if now > timestamp {
        return None;
    }

    Some(
        secrets
            .iter()
            .map(|secret| {
                let password = rest_api_password(secret, username);
                Password::Md5(codec::crypto::long_term_credential_digest(
                    username, &password, realm,
                ))
            })
            .collect(),
    )
}

/// Generate a server nonce: 32 hex characters from a strong source.
///
/// # Test
///
/// ```
/// use turn_relay_service::auth::make_nonce;
///
/// let nonce = make_nonce();
///
/// assert_eq!(nonce.len(), 32);
/// assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
/// assert_ne!(nonce, make_nonce());
/// ```
pub fn make_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);

    let mut nonce = String::with_capacity(32);
    for b in bytes {
        nonce.push_str(&format!("{:02x}", b));
    }

    nonce
}

/// An address pattern of the peer white/black lists: a bare IP or a
/// `addr/prefix` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPattern {
    addr: IpAddr,
    prefix: u8,
}

impl IpPattern {
    /// # Test
    ///
    /// ```
    /// use turn_relay_service::auth::IpPattern;
    ///
    /// let range: IpPattern = "10.0.0.0/8".parse().unwrap();
    ///
    /// assert!(range.matches(&"10.1.2.3".parse().unwrap()));
    /// assert!(!range.matches(&"11.1.2.3".parse().unwrap()));
    ///
    /// let single: IpPattern = "192.168.1.7".parse().unwrap();
    ///
    /// assert!(single.matches(&"192.168.1.7".parse().unwrap()));
    /// assert!(!single.matches(&"192.168.1.8".parse().unwrap()));
    /// ```
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(it)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };

                u32::from(net) & mask == u32::from(*it) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(it)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };

                u128::from(net) & mask == u128::from(*it) & mask
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct IpPatternParseError(String);

impl std::error::Error for IpPatternParseError {}

impl std::fmt::Display for IpPatternParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid ip pattern: {}", self.0)
    }
}

impl FromStr for IpPattern {
    type Err = IpPatternParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| IpPatternParseError(s.to_string()))?;
                let prefix: u8 = prefix.parse().map_err(|_| IpPatternParseError(s.to_string()))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| IpPatternParseError(s.to_string()))?;
                (addr, if addr.is_ipv4() { 32 } else { 128 })
            }
        };

        if prefix > if addr.is_ipv4() { 32 } else { 128 } {
            return Err(IpPatternParseError(s.to_string()));
        }

        Ok(Self { addr, prefix })
    }
}

/// Which peer addresses allocations may exchange data with.
///
/// The denied list rejects, the allowed list can punch holes back into
/// denied ranges. The multicast and loopback toggles mirror the
/// `no-multicast-peers` / `no-loopback-peers` options.
#[derive(Debug, Default, Clone)]
pub struct PeerPolicy {
    pub allowed: Vec<IpPattern>,
    pub denied: Vec<IpPattern>,
    pub no_multicast: bool,
    pub no_loopback: bool,
}

impl PeerPolicy {
    /// # Test
    ///
    /// ```
    /// use turn_relay_service::auth::*;
    ///
    /// let policy = PeerPolicy {
    ///     denied: vec!["10.0.0.0/8".parse().unwrap()],
    ///     allowed: vec!["10.10.0.0/16".parse().unwrap()],
    ///     no_multicast: true,
    ///     no_loopback: false,
    /// };
    ///
    /// assert!(!policy.permits(&"10.1.2.3".parse().unwrap()));
    /// assert!(policy.permits(&"10.10.2.3".parse().unwrap()));
    /// assert!(policy.permits(&"8.8.8.8".parse().unwrap()));
    /// assert!(!policy.permits(&"224.0.0.1".parse().unwrap()));
    /// assert!(policy.permits(&"127.0.0.1".parse().unwrap()));
    /// ```
    pub fn permits(&self, ip: &IpAddr) -> bool {
        if self.no_multicast && ip.is_multicast() {
            return false;
        }

        if self.no_loopback && ip.is_loopback() {
            return false;
        }

        if self.denied.iter().any(|it| it.matches(ip))
            && !self.allowed.iter().any(|it| it.matches(ip))
        {
            return false;
        }

        true
    }
}
