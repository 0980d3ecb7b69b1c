//! Shared application state for the webhook server.

use std::sync::Arc;

use livesync_core::{ChannelStore, DedupWatermarks};

use crate::reconcile::Reconciler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ChannelStore>,
    pub watermarks: Arc<DedupWatermarks>,
    pub reconciler: Arc<Reconciler>,
}
