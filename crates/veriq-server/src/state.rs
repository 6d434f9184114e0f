use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use veriq_core::clock::{Clock, SystemClock};
use veriq_core::config::Config;
use veriq_core::events::{EventSink, WorkEvent};
use veriq_core::store::Store;
use veriq_core::{paths, Platform};

/// Forwards committed work events to SSE subscribers.
struct BroadcastSink(broadcast::Sender<WorkEvent>);

impl EventSink for BroadcastSink {
    fn publish(&self, event: &WorkEvent) {
        // No subscribers is fine; the event log still has it.
        let _ = self.0.send(event.clone());
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub platform: Arc<Platform>,
    pub event_tx: broadcast::Sender<WorkEvent>,
}

impl AppState {
    pub fn open(root: PathBuf, config: Config) -> anyhow::Result<Self> {
        Self::with_clock(root, config, Arc::new(SystemClock))
    }

    pub fn with_clock(root: PathBuf, config: Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let (tx, _) = broadcast::channel(256);
        let store = Store::open(&paths::db_path(&root))?;
        let platform = Platform::with_clock(
            store,
            config,
            clock,
            Arc::new(BroadcastSink(tx.clone())),
        )?;
        Ok(Self {
            root,
            platform: Arc::new(platform),
            event_tx: tx,
        })
    }
}
