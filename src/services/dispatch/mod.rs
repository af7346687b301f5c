pub mod binary;
pub mod http;

use crate::config::{AppConfig, SinkKind};
use crate::error::AppError;
use crate::models::classify_types::{ClientId, LabelResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub use binary::BinaryDispatcher;
pub use http::HttpDispatcher;

/// Serializes a label result and hands it to a remote sink.
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn dispatch(&self, result: LabelResult) -> Result<(), AppError>;

    /// Blocks until every result already accepted by `dispatch` has left
    /// the process. Dispatchers that send synchronously have nothing to do.
    fn flush(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Builds the strategy selected by `config.sink`.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn Dispatcher>, AppError> {
    match config.sink {
        SinkKind::Binary => Ok(Arc::new(BinaryDispatcher::connect(&config.binary))),
        SinkKind::Http => Ok(Arc::new(HttpDispatcher::new(&config.elastic_search)?)),
    }
}

/// Lookup table from client handles to their dispatchers.
#[derive(Default)]
pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: RwLock<HashMap<ClientId, Arc<dyn Dispatcher>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dispatcher: Arc<dyn Dispatcher>) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, dispatcher);
        id
    }

    pub fn resolve(&self, id: ClientId) -> Result<Arc<dyn Dispatcher>, AppError> {
        self.clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .ok_or(AppError::UnknownClient(id))
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<dyn Dispatcher>> {
        self.clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
    }

    /// Flushes every registered dispatcher. Failures are logged.
    pub fn flush_all(&self) {
        let clients: Vec<(ClientId, Arc<dyn Dispatcher>)> = self
            .clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, dispatcher)| (*id, Arc::clone(dispatcher)))
            .collect();
        for (id, dispatcher) in clients {
            if let Err(e) = dispatcher.flush() {
                tracing::warn!(client = %id, sink = dispatcher.name(), "flush failed: {}", e);
            }
        }
    }

    /// Resolves the result's client and dispatches through it.
    pub fn dispatch(&self, result: LabelResult) -> Result<(), AppError> {
        let dispatcher = self.resolve(result.client)?;
        dispatcher.dispatch(result)
    }
}
