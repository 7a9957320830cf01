//! Handshake negotiation between the host and a freshly spawned plugin.
//!
//! The first line a plugin writes to stdout must be
//! `agenthub-plugin|<protocol-version>|<cookie>`. The cookie is a fixed
//! magic value that distinguishes a real plugin from an arbitrary
//! executable that happens to print to stdout; the version gates frame
//! compatibility. Anything else on the first line aborts the load.

use std::error::Error;
use std::fmt;

use subtle::ConstantTimeEq;

/// Current wire protocol version. Bumped when the frame format or the
/// mandatory RPC surface changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Leading token of the handshake line.
pub const HANDSHAKE_PREFIX: &str = "agenthub-plugin";

/// Magic cookie proving the child process is speaking this protocol on
/// purpose rather than emitting coincidental output.
pub const HANDSHAKE_COOKIE: &str = "f2a9c4d87b1e4e53a6c0d9b52f718e04";

/// Parsed handshake record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
}

/// Reasons a handshake line is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Line did not have the `prefix|version|cookie` shape.
    Malformed(String),
    /// Cookie did not match [`HANDSHAKE_COOKIE`].
    BadCookie,
    /// Version field was not a number or is newer than this host supports.
    UnsupportedVersion(String),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Malformed(line) => {
                write!(f, "malformed handshake line: {:?}", line)
            }
            HandshakeError::BadCookie => write!(f, "handshake cookie mismatch"),
            HandshakeError::UnsupportedVersion(v) => {
                write!(f, "unsupported protocol version: {}", v)
            }
        }
    }
}

impl Error for HandshakeError {}

/// Render the handshake line a plugin must emit first on stdout.
pub fn handshake_line() -> String {
    format!(
        "{}|{}|{}",
        HANDSHAKE_PREFIX, PROTOCOL_VERSION, HANDSHAKE_COOKIE
    )
}

/// Parse and verify a handshake line read from a plugin's stdout.
///
/// The cookie comparison is constant-time so a probing process cannot
/// learn the cookie byte-by-byte from timing.
pub fn parse_handshake(line: &str) -> Result<Handshake, HandshakeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, '|');
    let prefix = parts.next().unwrap_or_default();
    let version = parts.next();
    let cookie = parts.next();

    if prefix != HANDSHAKE_PREFIX {
        return Err(HandshakeError::Malformed(line.to_string()));
    }
    let (version, cookie) = match (version, cookie) {
        (Some(v), Some(c)) => (v, c),
        _ => return Err(HandshakeError::Malformed(line.to_string())),
    };

    let cookie_ok = cookie.len() == HANDSHAKE_COOKIE.len()
        && bool::from(cookie.as_bytes().ct_eq(HANDSHAKE_COOKIE.as_bytes()));
    if !cookie_ok {
        return Err(HandshakeError::BadCookie);
    }

    let protocol_version: u32 = version
        .parse()
        .map_err(|_| HandshakeError::UnsupportedVersion(version.to_string()))?;
    if protocol_version > PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    Ok(Handshake { protocol_version })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let parsed = parse_handshake(&handshake_line()).unwrap();
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn trailing_newline_is_tolerated() {
        let line = format!("{}\n", handshake_line());
        assert!(parse_handshake(&line).is_ok());
    }

    #[test]
    fn wrong_prefix_is_malformed() {
        let err = parse_handshake("not-a-plugin|1|whatever").unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
    }

    #[test]
    fn wrong_cookie_is_rejected() {
        let line = format!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, "deadbeef");
        assert_eq!(parse_handshake(&line).unwrap_err(), HandshakeError::BadCookie);
    }

    #[test]
    fn future_version_is_rejected() {
        let line = format!(
            "{}|{}|{}",
            HANDSHAKE_PREFIX,
            PROTOCOL_VERSION + 1,
            HANDSHAKE_COOKIE
        );
        assert!(matches!(
            parse_handshake(&line).unwrap_err(),
            HandshakeError::UnsupportedVersion(_)
        ));
    }

    #[test]
    fn missing_fields_are_malformed() {
        assert!(matches!(
            parse_handshake("agenthub-plugin|1").unwrap_err(),
            HandshakeError::Malformed(_)
        ));
    }
}
