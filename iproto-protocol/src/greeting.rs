//! Server greeting and challenge-response authentication.
//!
//! Every connection starts with a fixed 128-byte greeting:
//!
//! ```text
//! [0, 64)    version line, space padded, e.g. "Tarantool 2.11.1 (Binary) <uuid>"
//! [64, 108)  base64 salt (44 chars)
//! [108, 128) reserved
//! ```

use crate::error::ProtocolError;
use crate::GREETING_SIZE;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

const VERSION_LINE_SIZE: usize = 64;
const SALT_SIZE: usize = 44;

/// Number of salt bytes used by the scramble.
pub const SCRAMBLE_SIZE: usize = 20;

/// A server version, ordered by (major, minor, patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Packed form sent to the server: `major << 16 | minor << 8 | patch`.
    pub fn id(&self) -> u32 {
        u32::from(self.major) << 16 | u32::from(self.minor) << 8 | u32::from(self.patch)
    }

    /// Parses a dotted version, ignoring any suffix after the patch number
    /// (e.g. `2.10.4-0-g1a2b3c`).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '.');
        let major = leading_number(parts.next()?)?;
        let minor = leading_number(parts.next()?)?;
        let patch = parts.next().and_then(leading_number).unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn leading_number(s: &str) -> Option<u8> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// The parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// The version line as sent, without padding.
    pub banner: String,
    pub version: Option<Version>,
    /// Server instance UUID, when the banner carries one.
    pub instance_uuid: Option<Uuid>,
    /// Decoded salt.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Parses a raw greeting.
    pub fn parse(raw: &[u8; GREETING_SIZE]) -> Result<Self, ProtocolError> {
        let banner = std::str::from_utf8(&raw[..VERSION_LINE_SIZE])
            .map_err(|_| ProtocolError::InvalidGreeting("version line is not UTF-8"))?
            .trim_end()
            .to_string();
        if banner.is_empty() {
            return Err(ProtocolError::InvalidGreeting("empty version line"));
        }

        let mut tokens = banner.split_whitespace();
        let _product = tokens.next();
        let version = tokens.next().and_then(Version::parse);
        let instance_uuid = banner
            .split_whitespace()
            .last()
            .and_then(|t| Uuid::parse_str(t).ok());

        let salt_text = std::str::from_utf8(&raw[VERSION_LINE_SIZE..VERSION_LINE_SIZE + SALT_SIZE])
            .map_err(|_| ProtocolError::InvalidGreeting("salt is not UTF-8"))?
            .trim();
        let salt = STANDARD
            .decode(salt_text)
            .map_err(|_| ProtocolError::InvalidGreeting("salt is not base64"))?;
        if salt.len() < SCRAMBLE_SIZE {
            return Err(ProtocolError::InvalidGreeting("salt too short"));
        }

        Ok(Self {
            banner,
            version,
            instance_uuid,
            salt,
        })
    }

    /// Reads and parses the greeting from a freshly opened stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut raw = [0u8; GREETING_SIZE];
        reader.read_exact(&mut raw).await?;
        Self::parse(&raw)
    }

    /// Builds a raw greeting, as a server would send it.
    pub fn build(banner: &str, salt: &[u8]) -> [u8; GREETING_SIZE] {
        let mut raw = [b' '; GREETING_SIZE];
        let banner = &banner.as_bytes()[..banner.len().min(VERSION_LINE_SIZE - 1)];
        raw[..banner.len()].copy_from_slice(banner);
        raw[VERSION_LINE_SIZE - 1] = b'\n';

        let encoded = STANDARD.encode(salt);
        let encoded = &encoded.as_bytes()[..encoded.len().min(SALT_SIZE)];
        raw[VERSION_LINE_SIZE..VERSION_LINE_SIZE + encoded.len()].copy_from_slice(encoded);
        raw[GREETING_SIZE - 1] = b'\n';
        raw
    }

    /// Returns true if the server is at least `min`. Unknown versions fail.
    pub fn supports(&self, min: Version) -> bool {
        self.version.map_or(false, |v| v >= min)
    }
}

/// Computes the `chap-sha1` response to `salt` for `password`.
///
/// `sha1(password) XOR sha1(salt[..20] ++ sha1(sha1(password)))`
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);
    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE.min(salt.len())]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNER: &str = "Tarantool 2.10.4 (Binary) 7ed0d9e1-8d4a-4e5b-bd6e-0f2b0a3b5c11";

    #[test]
    fn test_parse_greeting() {
        let salt: Vec<u8> = (0u8..32).collect();
        let raw = Greeting::build(BANNER, &salt);
        let greeting = Greeting::parse(&raw).unwrap();

        assert_eq!(greeting.banner, BANNER);
        assert_eq!(greeting.version, Some(Version::new(2, 10, 4)));
        assert_eq!(
            greeting.instance_uuid.unwrap().to_string(),
            "7ed0d9e1-8d4a-4e5b-bd6e-0f2b0a3b5c11"
        );
        assert_eq!(greeting.salt, salt);
    }

    #[test]
    fn test_version_ordering_and_id() {
        let min = Version::new(2, 3, 1);
        assert!(Version::new(2, 10, 0) > min);
        assert!(Version::new(2, 3, 0) < min);
        assert!(Version::new(1, 10, 15) < min);
        assert_eq!(Version::new(2, 3, 1).id(), 0x020301);
        assert_eq!(Version::parse("2.11.1-entrypoint"), Some(Version::new(2, 11, 1)));
        assert_eq!(Version::parse("3.0"), Some(Version::new(3, 0, 0)));
        assert_eq!(Version::parse("garbage"), None);
    }

    #[test]
    fn test_supports() {
        let raw = Greeting::build("Tarantool 1.10.15 (Binary)", &[7u8; 32]);
        let greeting = Greeting::parse(&raw).unwrap();
        assert!(!greeting.supports(Version::new(2, 3, 1)));
        assert!(greeting.supports(Version::new(1, 6, 0)));
        assert!(greeting.instance_uuid.is_none());
    }

    #[test]
    fn test_invalid_salt() {
        let mut raw = Greeting::build(BANNER, &[1u8; 32]);
        raw[64..108].copy_from_slice(&[b'!'; 44]);
        assert!(matches!(
            Greeting::parse(&raw),
            Err(ProtocolError::InvalidGreeting(_))
        ));
    }

    #[test]
    fn test_scramble_is_reversible_by_server() {
        // The server stores sha1(sha1(password)) and checks
        // sha1(scramble XOR sha1(salt ++ stored)) == stored.
        let salt = [0x5au8; 32];
        let password = "secret";
        let out = scramble(&salt, password);

        let stored = Sha1::digest(Sha1::digest(password.as_bytes()));
        let mut hasher = Sha1::new();
        hasher.update(&salt[..SCRAMBLE_SIZE]);
        hasher.update(stored);
        let mask = hasher.finalize();

        let step1: Vec<u8> = out.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(Sha1::digest(&step1).as_slice(), stored.as_slice());
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let raw = Greeting::build(BANNER, &[3u8; 32]);
        let mut reader = &raw[..];
        let greeting = Greeting::read_from(&mut reader).await.unwrap();
        assert_eq!(greeting.version, Some(Version::new(2, 10, 4)));

        let mut short = &raw[..100];
        assert!(Greeting::read_from(&mut short).await.unwrap_err().is_eof());
    }
}
