//! Tzgate Common - Session and verdict types for the timezone challenge
//!
//! This crate holds the state that is parked between the two legs of a
//! challenge and the policy that decides whether a parked response is
//! released. It has no HTTP or I/O dependencies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Session encoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to serialize session: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("Failed to deserialize session: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),
}

/// Snapshot of an upstream response awaiting release
///
/// The body is kept as raw bytes so a replay reproduces exactly what the
/// protected handler produced; `charset` is what the response declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResponse {
    /// HTTP status code
    pub status: u16,

    /// Reason phrase sent on the status line, if any
    pub reason: Option<String>,

    /// Charset declared by the Content-Type header
    pub charset: Option<String>,

    /// Response headers in the order they were produced
    pub headers: Vec<(String, Bytes)>,

    /// Response body
    pub body: Bytes,
}

/// Correlation record for one client across both legs of a challenge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSession {
    /// Timezone confirmed by the last successful challenge
    pub verified_timezone: Option<String>,

    /// GeoIP timezone captured when the outstanding challenge was issued
    pub geoip_timezone: Option<String>,

    /// Response parked until the challenge resolves
    pub pending: Option<PendingResponse>,
}

/// An outstanding challenge removed from its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outstanding {
    pub geoip_timezone: String,
    pub pending: PendingResponse,
}

impl ChallengeSession {
    /// Whether a challenge is currently outstanding
    pub fn is_outstanding(&self) -> bool {
        self.geoip_timezone.is_some() && self.pending.is_some()
    }

    /// Park a captured response behind a new challenge
    pub fn park(&mut self, geoip_timezone: String, pending: PendingResponse) {
        self.geoip_timezone = Some(geoip_timezone);
        self.pending = Some(pending);
    }

    /// Take the outstanding challenge out of the session.
    ///
    /// Returns `None` (and leaves the session untouched) unless both the GeoIP
    /// timezone and the parked response are present.
    pub fn take_outstanding(&mut self) -> Option<Outstanding> {
        if !self.is_outstanding() {
            return None;
        }
        let pending = self.pending.take()?;
        let geoip_timezone = self.geoip_timezone.clone()?;
        Some(Outstanding {
            geoip_timezone,
            pending,
        })
    }

    /// Timezone the client is judged by when it submits no probe answer
    pub fn client_timezone_or_verified(&self, submitted: Option<String>) -> String {
        submitted
            .or_else(|| self.verified_timezone.clone())
            .unwrap_or_default()
    }

    /// Serialize the session to MessagePack bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from MessagePack bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Outcome of comparing the client timezone against GeoIP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Release the parked response
    Allow,
    /// Reject the request as coming through a VPN or proxy
    Deny,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        }
    }
}

/// Decide whether a client timezone is consistent with its GeoIP timezone.
///
/// An unknown GeoIP timezone never denies.
pub fn decide(geoip_timezone: &str, client_timezone: &str) -> Verdict {
    if geoip_timezone != constants::GEOIP_UNKNOWN && client_timezone != geoip_timezone {
        Verdict::Deny
    } else {
        Verdict::Allow
    }
}

/// Generate a new session ID
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Constants for the challenge protocol
pub mod constants {
    /// GeoIP timezone sentinel meaning "no data"
    pub const GEOIP_UNKNOWN: &str = "N/A";

    /// Form field carrying the browser timezone on the resume leg
    pub const CLIENT_TZ_FIELD: &str = "CLIENT_TZ";

    /// Status code of the probe page
    pub const PROBE_STATUS: u16 = 302;

    /// Redis key prefix for sessions
    pub const SESSION_PREFIX: &str = "tzgate:session:";

    /// Default session cookie name
    pub const SESSION_COOKIE: &str = "tzgate_session";

    /// Default session lifetime (two weeks)
    pub const SESSION_TTL_SECONDS: u64 = 14 * 24 * 60 * 60;

    /// Largest upstream body that will be parked
    pub const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingResponse {
        PendingResponse {
            status: 200,
            reason: Some("OK".to_string()),
            charset: Some("utf-8".to_string()),
            headers: vec![
                ("content-type".to_string(), Bytes::from_static(b"text/html; charset=utf-8")),
                ("x-frame-options".to_string(), Bytes::from_static(b"DENY")),
            ],
            body: Bytes::from_static("<h1>héllo</h1>".as_bytes()),
        }
    }

    #[test]
    fn test_unknown_geoip_always_allows() {
        assert_eq!(decide("N/A", "Europe/London"), Verdict::Allow);
        assert_eq!(decide("N/A", ""), Verdict::Allow);
        assert_eq!(decide("N/A", "N/A"), Verdict::Allow);
    }

    #[test]
    fn test_matching_timezone_allows() {
        assert_eq!(decide("Europe/London", "Europe/London"), Verdict::Allow);
        assert_eq!(decide("Asia/Tokyo", "Asia/Tokyo"), Verdict::Allow);
    }

    #[test]
    fn test_mismatching_timezone_denies() {
        assert_eq!(decide("Europe/Zurich", "Europe/London"), Verdict::Deny);
        assert_eq!(decide("Europe/London", ""), Verdict::Deny);
        assert_eq!(decide("Europe/London", "europe/london"), Verdict::Deny);
    }

    #[test]
    fn test_fresh_session_has_nothing_outstanding() {
        let mut session = ChallengeSession::default();
        assert!(!session.is_outstanding());
        assert!(session.take_outstanding().is_none());
    }

    #[test]
    fn test_incomplete_session_is_not_outstanding() {
        let mut session = ChallengeSession {
            verified_timezone: Some("Europe/London".to_string()),
            geoip_timezone: None,
            pending: Some(pending()),
        };
        assert!(session.take_outstanding().is_none());
        assert!(session.pending.is_some());
    }

    #[test]
    fn test_park_and_take() {
        let mut session = ChallengeSession::default();
        session.park("Europe/London".to_string(), pending());
        assert!(session.is_outstanding());

        let outstanding = session.take_outstanding().unwrap();
        assert_eq!(outstanding.geoip_timezone, "Europe/London");
        assert_eq!(outstanding.pending, pending());

        // Read once
        assert!(session.pending.is_none());
        assert!(session.take_outstanding().is_none());
    }

    #[test]
    fn test_client_timezone_fallback() {
        let mut session = ChallengeSession::default();
        assert_eq!(session.client_timezone_or_verified(None), "");

        session.verified_timezone = Some("Europe/London".to_string());
        assert_eq!(session.client_timezone_or_verified(None), "Europe/London");
        assert_eq!(
            session.client_timezone_or_verified(Some("Asia/Tokyo".to_string())),
            "Asia/Tokyo"
        );
    }

    #[test]
    fn test_session_bytes_roundtrip() {
        let mut session = ChallengeSession {
            verified_timezone: Some("Europe/London".to_string()),
            ..Default::default()
        };
        session.park("Europe/Zurich".to_string(), pending());

        let bytes = session.to_bytes().unwrap();
        let decoded = ChallengeSession::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        assert!(ChallengeSession::from_bytes(&[0xc1, 0x00, 0xff]).is_err());
    }
}
