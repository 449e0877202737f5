//! Tower layer that puts the challenge engine in front of a service

use super::ChallengeEngine;
use axum::{extract::Request, response::Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Layer implementation for the VPN check
#[derive(Clone)]
pub struct VpnCheckLayer {
    engine: ChallengeEngine,
}

impl VpnCheckLayer {
    pub fn new(engine: ChallengeEngine) -> Self {
        Self { engine }
    }
}

impl<S> Layer<S> for VpnCheckLayer {
    type Service = VpnCheckService<S>;

    fn layer(&self, service: S) -> Self::Service {
        VpnCheckService {
            inner: service,
            engine: self.engine.clone(),
        }
    }
}

/// Service implementation for the VPN check
#[derive(Clone)]
pub struct VpnCheckService<S> {
    inner: S,
    engine: ChallengeEngine,
}

impl<S> Service<Request> for VpnCheckService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The ready service goes into the future; keep a fresh clone here
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let engine = self.engine.clone();

        Box::pin(async move {
            let response = engine
                .process(request, move |request| async move {
                    let mut inner = inner;
                    match inner.call(request).await {
                        Ok(response) => response,
                        Err(never) => match never {},
                    }
                })
                .await;
            Ok(response)
        })
    }
}
