pub mod cache;
pub mod error;
pub mod http;
pub mod listener;
pub mod net;
pub mod request;
pub mod response;
pub mod worker;

use std::sync::Arc;

use crate::blocklist::Blocklist;
use crate::settings::Settings;

/// Shared, read-only state handed to every worker: the settings, the
/// blocklist, and the cache (whose interior mutability is confined to
/// its own mutex).
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub blocklist: Arc<Blocklist>,
    pub cache: Arc<cache::Cache>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        blocklist: Arc<Blocklist>,
        cache: Arc<cache::Cache>,
    ) -> Self {
        Self {
            settings,
            blocklist,
            cache,
        }
    }
}
