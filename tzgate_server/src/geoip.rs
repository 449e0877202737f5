//! GeoIP timezone lookup
//!
//! The challenge only needs one field from the GeoIP record: the IANA
//! timezone of the address. Every failure collapses into the "N/A" sentinel,
//! which the verdict policy never denies.

use maxminddb::{geoip2, MaxMindDBError, Reader};
#[cfg(test)]
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use tzgate_common::constants;

#[derive(Debug, thiserror::Error)]
pub enum GeoIpError {
    #[error("Failed to open GeoIP database: {0}")]
    Open(MaxMindDBError),

    #[error("GeoIP lookup failed: {0}")]
    Lookup(MaxMindDBError),
}

/// Source of GeoIP timezones
pub trait TimezoneResolver: Send + Sync {
    /// IANA timezone for an address, `None` when the database has no record
    fn timezone(&self, ip: IpAddr) -> Result<Option<String>, GeoIpError>;
}

/// Resolver backed by a MaxMind City database
pub struct MaxMindResolver {
    reader: Reader<Vec<u8>>,
}

impl MaxMindResolver {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GeoIpError> {
        let reader = Reader::open_readfile(path).map_err(GeoIpError::Open)?;
        tracing::info!(
            "Loaded GeoIP database {} (built {})",
            reader.metadata.database_type,
            reader.metadata.build_epoch
        );
        Ok(Self { reader })
    }
}

impl TimezoneResolver for MaxMindResolver {
    fn timezone(&self, ip: IpAddr) -> Result<Option<String>, GeoIpError> {
        match self.reader.lookup::<geoip2::City>(ip) {
            Ok(city) => Ok(city
                .location
                .and_then(|l| l.time_zone)
                .map(|tz| tz.to_string())),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(GeoIpError::Lookup(e)),
        }
    }
}

/// Resolver with a fixed address table
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    table: HashMap<IpAddr, String>,
}

#[cfg(test)]
impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, timezone: &str) -> Self {
        self.table.insert(ip, timezone.to_string());
        self
    }
}

#[cfg(test)]
impl TimezoneResolver for StaticResolver {
    fn timezone(&self, ip: IpAddr) -> Result<Option<String>, GeoIpError> {
        Ok(self.table.get(&ip).cloned())
    }
}

/// Resolver used when no database is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledResolver;

impl TimezoneResolver for DisabledResolver {
    fn timezone(&self, _ip: IpAddr) -> Result<Option<String>, GeoIpError> {
        Ok(None)
    }
}

/// Look up the GeoIP timezone of a client, mapping every gap to "N/A"
pub fn lookup_timezone(resolver: &dyn TimezoneResolver, ip: Option<IpAddr>) -> String {
    let Some(ip) = ip else {
        return constants::GEOIP_UNKNOWN.to_string();
    };

    if !is_routable(ip) {
        return constants::GEOIP_UNKNOWN.to_string();
    }

    match resolver.timezone(ip) {
        Ok(Some(tz)) if !tz.is_empty() => tz,
        Ok(_) => constants::GEOIP_UNKNOWN.to_string(),
        Err(e) => {
            tracing::warn!("GeoIP lookup for {} failed: {}", ip, e);
            constants::GEOIP_UNKNOWN.to_string()
        }
    }
}

/// Loopback, private and link-local addresses never have GeoIP data
fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_routable(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}
