use std::sync::Arc;

use crate::analytics::ChartCache;
use crate::config::AppConfig;
use crate::engine::{Ingestor, QueryFacade, ResetController};
use crate::notifications::NotificationManager;
use crate::store::EventStore;

/// Shared handles for the HTTP handlers. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub facade: Arc<QueryFacade>,
    pub controller: Arc<ResetController>,
    pub ingestor: Arc<Ingestor>,
    pub notifications: Arc<NotificationManager>,
}

impl AppState {
    pub fn new(store: Arc<EventStore>, notifications: Arc<NotificationManager>, config: &AppConfig) -> Self {
        let cache = Arc::new(ChartCache::new());
        let facade = Arc::new(QueryFacade::new(Arc::clone(&store), Arc::clone(&cache)));
        let controller = Arc::new(ResetController::new(
            Arc::clone(&store),
            cache,
            Arc::clone(&notifications),
            &config.reset.secret,
        ));
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&controller),
            Arc::clone(&notifications),
        ));

        Self {
            store,
            facade,
            controller,
            ingestor,
            notifications,
        }
    }
}
