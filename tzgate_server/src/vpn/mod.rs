//! Timezone challenge for VPN and proxy detection
//!
//! Compares the timezone reported by the browser with the one GeoIP assigns
//! to the client address, and only releases protected HTML responses when
//! they agree.

pub mod eligibility;
pub mod engine;
pub mod layer;
pub mod probe;
pub mod snapshot;

pub use engine::ChallengeEngine;
pub use layer::VpnCheckLayer;
