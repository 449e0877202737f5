//! Challenge/resume protocol engine
//!
//! An eligible request goes through two legs:
//! 1. Challenge: the protected handler runs, its response is parked in the
//!    session together with the GeoIP timezone of the client, and the probe
//!    page is returned instead.
//! 2. Resume: the probe posts the browser timezone back. A match releases the
//!    parked response unchanged; a mismatch clears the session and denies.

use super::{eligibility, probe, snapshot};
use crate::client_ip::client_ip;
use crate::config::VpnOptions;
use crate::geoip::{lookup_timezone, TimezoneResolver};
use crate::session::SessionStore;
use axum::{
    extract::{FromRequest, Request},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Form,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use dashmap::DashMap;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tzgate_common::{constants, decide, new_session_id, ChallengeSession, Outstanding, Verdict};
use uuid::Uuid;

/// Probe answer posted on the resume leg
#[derive(Debug, Deserialize)]
struct ProbeAnswer {
    #[serde(rename = "CLIENT_TZ")]
    client_tz: Option<String>,
}

/// Runs the two-leg timezone challenge in front of a protected handler
#[derive(Clone)]
pub struct ChallengeEngine {
    options: Arc<VpnOptions>,
    resolver: Arc<dyn TimezoneResolver>,
    store: SessionStore,
    cookie_name: Arc<str>,
    trust_forwarded: bool,
    /// Per-session locks: session_id -> mutex held for one request
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Session identity resolved from the request cookie
struct SessionKey {
    id: String,
    /// The client does not hold a cookie for this ID yet
    issued: bool,
}

/// Drops the per-session lock entry once no request holds or awaits it
struct LockRelease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: &'a str,
}

impl Drop for LockRelease<'_> {
    fn drop(&mut self) {
        self.locks
            .remove_if(self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ChallengeEngine {
    pub fn new(
        options: VpnOptions,
        resolver: Arc<dyn TimezoneResolver>,
        store: SessionStore,
        cookie_name: &str,
        trust_forwarded: bool,
    ) -> Self {
        Self {
            options: Arc::new(options),
            resolver,
            store,
            cookie_name: Arc::from(cookie_name),
            trust_forwarded,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Handle one request, calling `next` for the protected response when needed
    pub async fn process<F, Fut>(&self, request: Request, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        if !eligibility::is_eligible(&self.options, &request) {
            return next(request).await;
        }

        let key = self.session_key(request.headers());

        // Reading the session and writing it back must not interleave with
        // another request carrying the same cookie. The release guard is
        // declared first so it runs last, also when this future is dropped
        // while waiting for the lock or for `next`.
        let _release = LockRelease {
            locks: &self.locks,
            id: &key.id,
        };
        let lock = self
            .locks
            .entry(key.id.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        self.run(request, next, &key).await
    }

    async fn run<F, Fut>(&self, request: Request, next: F, key: &SessionKey) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let mut session = if key.issued {
            ChallengeSession::default()
        } else {
            match self.store.get(&key.id).await {
                Ok(session) => session.unwrap_or_default(),
                Err(e) => {
                    tracing::warn!("Failed to load session {}: {}", key.id, e);
                    ChallengeSession::default()
                }
            }
        };

        match session.take_outstanding() {
            Some(outstanding) => self.resolve(request, key, session, outstanding).await,
            None => self.challenge(request, next, key, session).await,
        }
    }

    /// First leg: park the protected response and send the probe
    async fn challenge<F, Fut>(
        &self,
        request: Request,
        next: F,
        key: &SessionKey,
        mut session: ChallengeSession,
    ) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let ip = client_ip(&request, self.trust_forwarded);
        let geoip_timezone = lookup_timezone(self.resolver.as_ref(), ip);

        // Without GeoIP data the verdict is always allow, so skip the round-trip
        if geoip_timezone == constants::GEOIP_UNKNOWN {
            tracing::debug!("No GeoIP timezone for {:?}, passing through", ip);
            return next(request).await;
        }

        let action = request
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        let response = next(request).await;
        let pending = match snapshot::capture(response, self.options.max_capture_bytes).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!("Failed to buffer protected response: {}", e);
                return (StatusCode::BAD_GATEWAY, "Failed to read upstream response")
                    .into_response();
            }
        };

        session.park(geoip_timezone.clone(), pending);

        if let Err(e) = self.store.set(&key.id, &session).await {
            tracing::error!("Failed to park response for session {}: {}", key.id, e);
            return match session.pending.take() {
                Some(pending) => snapshot::replay(pending),
                None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            };
        }

        tracing::debug!(
            "Issued timezone challenge to {:?} (GeoIP: {})",
            ip,
            geoip_timezone
        );

        let mut response = probe::render(&action);
        if key.issued {
            self.set_cookie(response.headers_mut(), &key.id);
        }
        response
    }

    /// Second leg: compare the probe answer and release or deny
    async fn resolve(
        &self,
        request: Request,
        key: &SessionKey,
        mut session: ChallengeSession,
        outstanding: Outstanding,
    ) -> Response {
        let submitted = submitted_timezone(request).await;
        let client_timezone = session.client_timezone_or_verified(submitted);
        let verdict = decide(&outstanding.geoip_timezone, &client_timezone);

        match verdict {
            Verdict::Allow => {
                session.verified_timezone = Some(outstanding.geoip_timezone);
                if let Err(e) = self.store.set(&key.id, &session).await {
                    tracing::warn!("Failed to save verified session {}: {}", key.id, e);
                    // The stored record still holds the parked response
                    if let Err(e) = self.store.delete(&key.id).await {
                        tracing::error!("Failed to clear session {}: {}", key.id, e);
                    }
                }
                tracing::debug!(
                    "Verdict {} for session {}, releasing parked response",
                    verdict.as_str(),
                    key.id
                );
                snapshot::replay(outstanding.pending)
            }
            Verdict::Deny => {
                if let Err(e) = self.store.delete(&key.id).await {
                    tracing::warn!("Failed to clear session {}: {}", key.id, e);
                }
                tracing::info!(
                    "Verdict {} for session {}: GeoIP {} vs client {:?}",
                    verdict.as_str(),
                    key.id,
                    outstanding.geoip_timezone,
                    client_timezone
                );
                self.deny_response()
            }
        }
    }

    fn deny_response(&self) -> Response {
        match &self.options.forbidden_url {
            Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.as_str())]).into_response(),
            None => StatusCode::FORBIDDEN.into_response(),
        }
    }

    /// Session ID from the cookie, or a freshly issued one
    fn session_key(&self, headers: &HeaderMap) -> SessionKey {
        let jar = CookieJar::from_headers(headers);
        let existing = jar
            .get(&self.cookie_name)
            .map(|c| c.value())
            .filter(|v| Uuid::parse_str(v).is_ok());

        match existing {
            Some(id) => SessionKey {
                id: id.to_string(),
                issued: false,
            },
            None => SessionKey {
                id: new_session_id(),
                issued: true,
            },
        }
    }

    fn set_cookie(&self, headers: &mut HeaderMap, id: &str) {
        let cookie = Cookie::build((self.cookie_name.to_string(), id.to_string()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .build();

        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::error!("Invalid session cookie: {}", e),
        }
    }
}

/// Timezone posted by the probe form, if any
async fn submitted_timezone(request: Request) -> Option<String> {
    if request.method() != Method::POST {
        return None;
    }

    match Form::<ProbeAnswer>::from_request(request, &()).await {
        Ok(Form(answer)) => answer.client_tz,
        Err(e) => {
            tracing::debug!("No probe answer in request body: {}", e);
            None
        }
    }
}
