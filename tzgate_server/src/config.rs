//! Server configuration loaded from environment variables

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tzgate_common::constants;

const MAX_SESSION_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// Public port for HTTP traffic
    pub port: u16,

    /// Base URL of the protected application (e.g., "http://127.0.0.1:3000")
    pub upstream_url: String,

    /// Options for the VPN check itself
    pub vpn: VpnOptions,

    /// GeoLite2/GeoIP2 City database; lookups answer "N/A" when unset
    pub geoip_db_path: Option<PathBuf>,

    /// Redis connection string; sessions are kept in memory when unset
    pub redis_url: Option<String>,

    /// Name of the cookie carrying the session ID
    pub session_cookie: String,

    /// How long an idle session survives
    pub session_ttl: Duration,

    /// Trust Forwarded / X-Forwarded-For / X-Real-IP for the client address
    pub trust_forwarded: bool,
}

/// Options injected into the challenge engine
#[derive(Debug, Clone)]
pub struct VpnOptions {
    /// Whether the VPN check runs at all
    pub enabled: bool,

    /// Where denied clients are redirected; a bare 403 is returned when unset
    pub forbidden_url: Option<String>,

    /// Largest upstream body that will be parked behind a challenge
    pub max_capture_bytes: usize,
}

impl Default for VpnOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            forbidden_url: None,
            max_capture_bytes: constants::MAX_CAPTURE_BYTES,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            upstream_url: env::var("UPSTREAM_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .map_err(|_| ConfigError::MissingEnv("UPSTREAM_URL"))?,
            vpn: VpnOptions {
                enabled: parse_flag("VPN", env::var("VPN").ok())?,
                forbidden_url: non_empty(env::var("FORBIDDEN_VPN_URL").ok()),
                max_capture_bytes: match env::var("MAX_CAPTURE_BYTES") {
                    Ok(v) => v
                        .parse()
                        .map_err(|_| ConfigError::InvalidNumber("MAX_CAPTURE_BYTES"))?,
                    Err(_) => constants::MAX_CAPTURE_BYTES,
                },
            },
            geoip_db_path: non_empty(env::var("GEOIP_DB_PATH").ok()).map(PathBuf::from),
            redis_url: non_empty(env::var("REDIS_URL").ok()),
            session_cookie: env::var("SESSION_COOKIE")
                .unwrap_or_else(|_| constants::SESSION_COOKIE.to_string()),
            session_ttl: parse_ttl(env::var("SESSION_TTL_SECONDS").ok())?,
            trust_forwarded: parse_flag("TRUST_FORWARDED", env::var("TRUST_FORWARDED").ok())?,
        })
    }
}

/// Parse a boolean switch; unset means off
fn parse_flag(name: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag(name)),
    }
}

/// Parse the session TTL; unset means the default, zero or beyond
/// ten years is rejected
fn parse_ttl(value: Option<String>) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(Duration::from_secs(constants::SESSION_TTL_SECONDS));
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if (1..=MAX_SESSION_TTL_SECONDS).contains(&secs) => {
            Ok(Duration::from_secs(secs))
        }
        _ => Err(ConfigError::InvalidNumber("SESSION_TTL_SECONDS")),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid boolean for {0} (expected true/false)")]
    InvalidFlag(&'static str),

    #[error("Invalid number for {0}")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(!parse_flag("VPN", None).unwrap());
        assert!(parse_flag("VPN", Some("true".to_string())).unwrap());
        assert!(parse_flag("VPN", Some(" ON ".to_string())).unwrap());
        assert!(parse_flag("VPN", Some("1".to_string())).unwrap());
        assert!(!parse_flag("VPN", Some("off".to_string())).unwrap());
        assert!(!parse_flag("VPN", Some(String::new())).unwrap());
        assert!(matches!(
            parse_flag("VPN", Some("maybe".to_string())),
            Err(ConfigError::InvalidFlag("VPN"))
        ));
    }

    #[test]
    fn test_parse_ttl() {
        assert_eq!(
            parse_ttl(None).unwrap(),
            Duration::from_secs(constants::SESSION_TTL_SECONDS)
        );
        assert_eq!(
            parse_ttl(Some(" 3600 ".to_string())).unwrap(),
            Duration::from_secs(3600)
        );
        for bad in ["0", "-5", "soon", "18446744073709551615", "315360001"] {
            assert!(matches!(
                parse_ttl(Some(bad.to_string())),
                Err(ConfigError::InvalidNumber("SESSION_TTL_SECONDS"))
            ));
        }
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(
            non_empty(Some(" /forbidden ".to_string())),
            Some("/forbidden".to_string())
        );
    }

    #[test]
    fn test_vpn_options_default_is_off() {
        let options = VpnOptions::default();
        assert!(!options.enabled);
        assert!(options.forbidden_url.is_none());
        assert_eq!(options.max_capture_bytes, constants::MAX_CAPTURE_BYTES);
    }
}
