use server_api::ApiContext;
use shared::protocol::ChangeEvent;
use tokio::sync::broadcast;

use crate::auth::TokenKeys;

pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) tokens: TokenKeys,
    pub(crate) changes: broadcast::Sender<ChangeEvent>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, tokens: TokenKeys) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            api,
            tokens,
            changes,
        }
    }

    /// Fans committed changes out to every realtime connection, in production order.
    pub(crate) fn publish(&self, changes: Vec<ChangeEvent>) {
        for change in changes {
            // No receivers just means nobody is listening.
            let _ = self.changes.send(change);
        }
    }
}
