//! HTTP server: webhook intake from the host and the CI providers.
//!
//! Intake handlers are stateless and run concurrently; they authenticate,
//! normalize and enqueue. All real work happens on the per-repository
//! supervisors.
//!
//! # Endpoints
//!
//! - `POST /github` - host webhook (PR lifecycle, comments, pushes)
//! - `POST /buildbot` - buildbot status push (form-encoded, shared secret)
//! - `POST /travis` - travis status push (token auth)
//! - `POST /jenkins` - jenkins status push (HMAC in body)
//! - `POST /solano` - solano status push (HMAC in body)
//! - `GET /health` - liveness probe

use std::sync::Arc;

use crate::config::Config;
use crate::worker::Dispatcher;

pub mod ci_hooks;
pub mod health;
pub mod webhook;

pub use health::health_handler;

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { config, dispatcher }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/github", post(webhook::github_handler))
        .route("/buildbot", post(ci_hooks::buildbot_handler))
        .route("/travis", post(ci_hooks::travis_handler))
        .route("/jenkins", post(ci_hooks::jenkins_handler))
        .route("/solano", post(ci_hooks::solano_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
