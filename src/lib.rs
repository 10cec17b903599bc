pub mod auth;
pub mod config;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;
pub mod websocket;
pub mod ws;

use std::sync::Arc;

use crate::config::Config;
use crate::ws::SyncHub;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SyncHub>,
    /// HS256 secret for bearer tokens. `None` disables authorization.
    pub auth_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(hub: Arc<SyncHub>, auth_secret: Option<&str>) -> Self {
        Self {
            hub,
            auth_secret: auth_secret.map(Arc::from),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Arc::new(SyncHub::from_config(config)), config.auth_jwt_secret.as_deref())
    }
}
