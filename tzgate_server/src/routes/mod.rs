//! Route handlers for the Tzgate server

pub mod proxy;

use crate::{config::Config, session::SessionStore};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionStore,
    /// Client for the protected upstream (redirects are passed through, not followed)
    pub http_client: reqwest::Client,
    /// Whether a GeoIP database is loaded
    pub geoip_loaded: bool,
}

impl AppState {
    pub fn new(config: Config, sessions: SessionStore, geoip_loaded: bool) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            sessions,
            http_client,
            geoip_loaded,
        })
    }
}
