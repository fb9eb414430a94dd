//! Manager role: drives the pipeline and accepts captures from readers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use phonendo_mesh::{
    DispatcherBuilder, NegotiatorBuilder, Orchestrator, PipelineEvent, ReplayEvent,
};
use phonendo_protocol::Protocol;

use super::load;

#[derive(Clone)]
pub struct ManagerService {
    orchestrator: Orchestrator,
    load_interval: Option<Duration>,
    load_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ManagerService {
    pub fn new(orchestrator: Orchestrator, load_interval: Option<Duration>) -> Self {
        Self {
            orchestrator,
            load_interval,
            load_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn negotiator(&self, builder: NegotiatorBuilder) -> NegotiatorBuilder {
        self.orchestrator.install_hooks(builder)
    }

    pub fn routes(&self, builder: DispatcherBuilder) -> DispatcherBuilder {
        builder.route(Protocol::Capture, self.orchestrator.capture_handler())
    }

    /// In demo mode, start synthetic captures once a replay pass finds
    /// nothing left to do. Returns `None` when no interval is configured.
    pub fn start_demo_load(&self) -> Option<JoinHandle<()>> {
        let interval = self.load_interval?;
        let mut events = self.orchestrator.subscribe();
        let this = self.clone();

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PipelineEvent::Replay(ReplayEvent::Completed { replayed: 0 })) => {
                        this.spawn_load(interval).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Demo load watcher lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }))
    }

    async fn spawn_load(&self, interval: Duration) {
        let mut slot = self.load_task.lock().await;
        if slot.is_some() {
            return;
        }
        let orchestrator = self.orchestrator.clone();
        *slot = Some(load::spawn_load(interval, move |record| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.capture(record).await }
        }));
    }

    pub async fn load_running(&self) -> bool {
        self.load_task.lock().await.is_some()
    }
}
