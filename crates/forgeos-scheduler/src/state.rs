use crate::auth::JwksCache;
use crate::config::Config;
use crate::leader::LeaderState;
use forgeos_store::SchedulerStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SchedulerStore>,
    pub cfg: Config,
    pub leader: Arc<LeaderState>,
    pub jwks: Option<Arc<JwksCache>>,
}
