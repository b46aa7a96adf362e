//! Training run against `/train_data`.
//!
//! Training has no upload steps: the server already holds the session's data, so the
//! controller only checks the session and then reads the stream.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use shared::domain::{LogEntry, RunKind, SessionReadiness};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::WizardBackend,
    describe_transport_error,
    session_probe::SessionProbe,
    stream::{RunEvent, RunHandle, RunId, RunLog, RunProfile, RunSink, RunStatus, WeakSink},
    wait_until_settled, ActiveRun, ControllerError, WizardEvent,
};

#[derive(Default)]
struct TrainingInner {
    log: RunLog,
    session: Option<SessionReadiness>,
    active_run: Option<ActiveRun>,
}

pub struct TrainingController {
    backend: Arc<dyn WizardBackend>,
    probe: SessionProbe,
    inner: Mutex<TrainingInner>,
    next_run_id: AtomicU64,
    run_status: watch::Sender<RunStatus>,
    events: broadcast::Sender<WizardEvent>,
}

impl TrainingController {
    pub fn new(backend: Arc<dyn WizardBackend>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (run_status, _) = watch::channel(RunStatus::Idle);
        Arc::new(Self {
            probe: SessionProbe::new(Arc::clone(&backend)),
            backend,
            inner: Mutex::new(TrainingInner::default()),
            next_run_id: AtomicU64::new(1),
            run_status,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WizardEvent> {
        self.events.subscribe()
    }

    pub async fn mount(&self) -> SessionReadiness {
        let readiness = self.probe.probe().await;
        self.record_session(&mut *self.inner.lock().await, readiness.clone());
        readiness
    }

    pub async fn log(&self) -> Vec<LogEntry> {
        self.inner.lock().await.log.entries().to_vec()
    }

    pub async fn status(&self) -> RunStatus {
        self.inner.lock().await.log.status()
    }

    pub async fn session(&self) -> Option<SessionReadiness> {
        self.inner.lock().await.session.clone()
    }

    /// A completed training is final; failed or stopped runs may be started again.
    pub async fn start(self: &Arc<Self>) -> Result<RunId, ControllerError> {
        self.ensure_startable(&*self.inner.lock().await)?;

        let readiness = self.probe.probe().await;
        let id = {
            let mut inner = self.inner.lock().await;
            self.record_session(&mut inner, readiness.clone());
            if !readiness.is_ready() {
                return Err(ControllerError::SessionNotReady(readiness));
            }
            self.ensure_startable(&inner)?;
            let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
            inner.active_run = Some(ActiveRun { id, handle: None });
            inner.log.begin();
            self.run_status.send_replace(RunStatus::Active);
            id
        };

        let opened = self.backend.open_run_stream(RunKind::Training).await;

        let mut inner = self.inner.lock().await;
        if inner.active_run.as_ref().map(|run| run.id) != Some(id) {
            return Err(ControllerError::Failed(
                "the run was cancelled before it started".into(),
            ));
        }
        match opened {
            Ok(stream) => {
                let sink: Arc<dyn RunSink> = Arc::new(WeakSink::new(self));
                let handle =
                    RunHandle::spawn(id, stream, RunProfile::for_kind(RunKind::Training), sink);
                inner.active_run = Some(ActiveRun {
                    id,
                    handle: Some(handle),
                });
                info!(run = id, "training: run started");
                Ok(id)
            }
            Err(err) => {
                warn!(run = id, error = %err, "training: failed to open the stream");
                let message = describe_transport_error(&err);
                self.apply_event(&mut inner, RunEvent::Failed(message.clone()));
                Err(ControllerError::Failed(message))
            }
        }
    }

    pub async fn stop(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.active_run.take() else {
            return false;
        };
        info!(run = run.id, "training: stopping run");
        run.cancel();
        let before = inner.log.entries().len();
        if !inner.log.stop() {
            return false;
        }
        self.publish_tail(&inner.log, before);
        self.finish(RunStatus::Stopped);
        true
    }

    pub async fn wait(&self) -> RunStatus {
        wait_until_settled(self.run_status.subscribe()).await
    }

    fn ensure_startable(&self, inner: &TrainingInner) -> Result<(), ControllerError> {
        if inner.active_run.is_some() {
            return Err(ControllerError::RunInProgress);
        }
        if inner.log.status() == RunStatus::Completed {
            return Err(ControllerError::Failed("training has already completed".into()));
        }
        Ok(())
    }

    fn record_session(&self, inner: &mut TrainingInner, readiness: SessionReadiness) {
        inner.session = Some(readiness.clone());
        let _ = self.events.send(WizardEvent::SessionChecked(readiness));
    }

    fn apply_event(&self, inner: &mut TrainingInner, event: RunEvent) {
        let before = inner.log.entries().len();
        if !inner.log.apply(&event) {
            return;
        }
        self.publish_tail(&inner.log, before);
        let status = inner.log.status();
        if status.is_terminal() {
            inner.active_run = None;
            self.finish(status);
        }
    }

    fn publish_tail(&self, log: &RunLog, from: usize) {
        for entry in log.entries().iter().skip(from) {
            let _ = self.events.send(WizardEvent::LogAppended(entry.clone()));
        }
    }

    fn finish(&self, status: RunStatus) {
        self.run_status.send_replace(status);
        let _ = self.events.send(WizardEvent::RunFinished(status));
    }
}

impl Drop for TrainingController {
    fn drop(&mut self) {
        if let Some(run) = self.inner.get_mut().active_run.take() {
            debug!(run = run.id, "training: controller dropped, cancelling run");
            run.cancel();
        }
    }
}

#[async_trait]
impl RunSink for TrainingController {
    async fn deliver(&self, run: RunId, event: RunEvent) {
        let mut inner = self.inner.lock().await;
        if inner.active_run.as_ref().map(|active| active.id) != Some(run) {
            debug!(run, "training: dropping event from a run that is no longer active");
            return;
        }
        self.apply_event(&mut inner, event);
    }
}

#[cfg(test)]
#[path = "tests/training_tests.rs"]
mod tests;
