use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use shared::{
    domain::{LogEntry, RunKind, SegmentParameters, SessionReadiness, WizardStage},
    protocol::{FileInfo, ProcessRequest, ProcessingInfo, ValidateParametersRequest, ValidationInfo},
};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub mod backend;
pub mod session_probe;
pub mod stream;
pub mod training;
pub mod transport;
pub mod wizard;

pub use backend::{BackendRoutes, HttpBackend, WizardBackend};
pub use session_probe::SessionProbe;
pub use stream::{RunEvent, RunId, RunStatus};
pub use training::TrainingController;
pub use wizard::{Command, Transition, WizardAction, WizardState};

use stream::{RunHandle, RunProfile, RunSink, WeakSink};
use transport::TransportError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{command:?} is not available while the wizard is at stage '{}'", stage.label())]
    NotAllowed {
        command: Command,
        stage: WizardStage,
    },
    #[error("another request is still in flight")]
    Busy,
    #[error("a run is already in progress")]
    RunInProgress,
    #[error("{}", .0.describe())]
    SessionNotReady(SessionReadiness),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum WizardEvent {
    StageChanged { from: WizardStage, to: WizardStage },
    Status(String),
    LogAppended(LogEntry),
    SessionChecked(SessionReadiness),
    RunFinished(RunStatus),
}

/// One-line description of a transport failure for the status line.
pub fn describe_transport_error(err: &TransportError) -> String {
    match err {
        TransportError::RequestFailed { message, .. } => {
            message.lines().next().unwrap_or(message).to_string()
        }
        TransportError::Network(_) => "the server could not be reached".to_string(),
        TransportError::Decode(_) => "the server sent an unexpected response".to_string(),
        TransportError::InvalidUrl { url, .. } => format!("invalid server address {url}"),
    }
}

pub(crate) struct ActiveRun {
    pub(crate) id: RunId,
    pub(crate) handle: Option<RunHandle>,
}

impl ActiveRun {
    pub(crate) fn cancel(self) {
        if let Some(handle) = self.handle {
            handle.cancel();
        }
    }
}

struct ControllerInner {
    state: WizardState,
    active_run: Option<ActiveRun>,
    in_flight: bool,
    /// Bumped by every reset so late responses can be told apart.
    epoch: u64,
}

const RESET_WHILE_IN_FLIGHT: &str = "the wizard was reset while the request was in flight";

/// Drives the upload → validate → process → test workflow against a backend.
pub struct WizardController {
    backend: Arc<dyn WizardBackend>,
    probe: SessionProbe,
    inner: Mutex<ControllerInner>,
    next_run_id: AtomicU64,
    run_status: watch::Sender<RunStatus>,
    events: broadcast::Sender<WizardEvent>,
}

impl WizardController {
    pub fn new(backend: Arc<dyn WizardBackend>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (run_status, _) = watch::channel(RunStatus::Idle);
        Arc::new(Self {
            probe: SessionProbe::new(Arc::clone(&backend)),
            backend,
            inner: Mutex::new(ControllerInner {
                state: WizardState::default(),
                active_run: None,
                in_flight: false,
                epoch: 0,
            }),
            next_run_id: AtomicU64::new(1),
            run_status,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WizardEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> WizardState {
        self.inner.lock().await.state.clone()
    }

    /// Initial session check when the wizard is first shown.
    pub async fn mount(&self) -> SessionReadiness {
        let readiness = self.probe.probe().await;
        let mut inner = self.inner.lock().await;
        self.dispatch(&mut inner, WizardAction::SessionProbed(readiness.clone()));
        readiness
    }

    pub async fn upload_csv(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<FileInfo, ControllerError> {
        let epoch = self
            .begin_request(Command::PickFile, Some(WizardAction::UploadStarted))
            .await?;
        let result = self.backend.upload_csv(filename, bytes).await;

        let mut inner = self.finish_request(epoch).await?;
        let outcome = match result {
            Ok(response) => response.into_result("file upload failed"),
            Err(err) => {
                warn!(%filename, error = %err, "wizard: csv upload failed");
                Err(describe_transport_error(&err))
            }
        };
        match outcome {
            Ok(file) => {
                self.dispatch(&mut inner, WizardAction::UploadSucceeded(file.clone()))
                    .applied()
                    .then_some(file)
                    .ok_or_else(|| ControllerError::Failed(RESET_WHILE_IN_FLIGHT.into()))
            }
            Err(message) => {
                self.dispatch(&mut inner, WizardAction::UploadFailed(message.clone()));
                Err(ControllerError::Failed(message))
            }
        }
    }

    /// Uploads an already segmented dataset, which makes the run available right away.
    pub async fn upload_dataset(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<u64, ControllerError> {
        let epoch = self
            .begin_request(Command::PickFile, Some(WizardAction::UploadStarted))
            .await?;
        let result = self.backend.upload_dataset(filename, bytes).await;

        let mut inner = self.finish_request(epoch).await?;
        let outcome = match result {
            Ok(response) => response.into_result("dataset upload failed"),
            Err(err) => {
                warn!(%filename, error = %err, "wizard: dataset upload failed");
                Err(describe_transport_error(&err))
            }
        };
        match outcome {
            Ok(total_count) => self
                .dispatch(&mut inner, WizardAction::DatasetUploaded { total_count })
                .applied()
                .then_some(total_count)
                .ok_or_else(|| ControllerError::Failed(RESET_WHILE_IN_FLIGHT.into())),
            Err(message) => {
                self.dispatch(&mut inner, WizardAction::UploadFailed(message.clone()));
                Err(ControllerError::Failed(message))
            }
        }
    }

    pub async fn set_parameters(
        &self,
        parameters: SegmentParameters,
    ) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock().await;
        self.gate(&inner, Command::EditParameters)?;
        if inner.in_flight {
            return Err(ControllerError::Busy);
        }
        self.dispatch(&mut inner, WizardAction::ParametersChanged(parameters));
        Ok(())
    }

    pub async fn set_save_filename(&self, name: &str) -> Result<(), ControllerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ControllerError::Failed(
                "save filename must not be empty".into(),
            ));
        }
        let mut inner = self.inner.lock().await;
        self.gate(&inner, Command::EditSaveFilename)?;
        self.dispatch(&mut inner, WizardAction::SaveFilenameChanged(name.to_string()));
        Ok(())
    }

    pub async fn validate(&self) -> Result<ValidationInfo, ControllerError> {
        let epoch = self.begin_request(Command::Validate, None).await?;
        let request = ValidateParametersRequest::from(self.inner.lock().await.state.parameters());
        let result = self.backend.validate_parameters(&request).await;

        let mut inner = self.finish_request(epoch).await?;
        match result {
            Ok(response) => {
                let checked = response
                    .into_result("invalid parameters")
                    .and_then(|info| info.check_consistency().map(|()| info));
                match checked {
                    Ok(info) => {
                        info!(
                            available = info.available_segments,
                            final_segments = info.final_segments,
                            "wizard: parameters validated"
                        );
                        self.dispatch(&mut inner, WizardAction::ValidationSucceeded(info.clone()))
                            .applied()
                            .then_some(info)
                            .ok_or_else(|| ControllerError::Failed(RESET_WHILE_IN_FLIGHT.into()))
                    }
                    Err(message) => {
                        self.dispatch(
                            &mut inner,
                            WizardAction::ValidationRejected(message.clone()),
                        );
                        Err(ControllerError::Failed(message))
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "wizard: validation request failed");
                let message = format!(
                    "could not validate parameters: {}",
                    describe_transport_error(&err)
                );
                self.dispatch(&mut inner, WizardAction::ValidationFailed(message.clone()));
                Err(ControllerError::Failed(message))
            }
        }
    }

    pub async fn process(&self) -> Result<ProcessingInfo, ControllerError> {
        let epoch = self
            .begin_request(Command::Process, Some(WizardAction::ProcessingStarted))
            .await?;
        let request = {
            let inner = self.inner.lock().await;
            let parameters = inner.state.parameters();
            ProcessRequest {
                trim_seconds: parameters.trim_seconds,
                y_segments: parameters.y_segments,
                save_filename: inner.state.save_filename().to_string(),
            }
        };
        let result = self.backend.process_and_save(&request).await;

        let mut inner = self.finish_request(epoch).await?;
        let outcome = match result {
            Ok(response) => response.into_result("failed to create the segment file"),
            Err(err) => {
                warn!(error = %err, "wizard: process request failed");
                Err(describe_transport_error(&err))
            }
        };
        match outcome {
            Ok(info) => self
                .dispatch(&mut inner, WizardAction::ProcessingSucceeded(info.clone()))
                .applied()
                .then_some(info)
                .ok_or_else(|| ControllerError::Failed(RESET_WHILE_IN_FLIGHT.into())),
            Err(message) => {
                self.dispatch(&mut inner, WizardAction::ProcessingFailed(message.clone()));
                Err(ControllerError::Failed(message))
            }
        }
    }

    /// Re-checks the session, then opens the test stream and reads it in the background.
    pub async fn start_run(self: &Arc<Self>) -> Result<RunId, ControllerError> {
        {
            let inner = self.inner.lock().await;
            if inner.active_run.is_some() {
                return Err(ControllerError::RunInProgress);
            }
            self.gate(&inner, Command::Run)?;
        }

        let readiness = self.probe.probe().await;
        let id = {
            let mut inner = self.inner.lock().await;
            self.dispatch(&mut inner, WizardAction::SessionProbed(readiness.clone()));
            if !readiness.is_ready() {
                return Err(ControllerError::SessionNotReady(readiness));
            }
            if inner.active_run.is_some() {
                return Err(ControllerError::RunInProgress);
            }
            self.gate(&inner, Command::Run)?;
            let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
            inner.active_run = Some(ActiveRun { id, handle: None });
            self.dispatch(&mut inner, WizardAction::RunStarted);
            id
        };

        let opened = self.backend.open_run_stream(RunKind::Testing).await;

        let mut inner = self.inner.lock().await;
        if inner.active_run.as_ref().map(|run| run.id) != Some(id) {
            debug!(run = id, "wizard: run was cancelled before its stream opened");
            return Err(ControllerError::Failed(
                "the run was cancelled before it started".into(),
            ));
        }
        match opened {
            Ok(stream) => {
                let sink: Arc<dyn RunSink> = Arc::new(WeakSink::new(self));
                let handle =
                    RunHandle::spawn(id, stream, RunProfile::for_kind(RunKind::Testing), sink);
                inner.active_run = Some(ActiveRun {
                    id,
                    handle: Some(handle),
                });
                info!(run = id, "wizard: test run started");
                Ok(id)
            }
            Err(err) => {
                warn!(run = id, error = %err, "wizard: failed to open the test stream");
                let message = describe_transport_error(&err);
                self.dispatch(&mut inner, WizardAction::Run(RunEvent::Failed(message.clone())));
                Err(ControllerError::Failed(message))
            }
        }
    }

    /// Cancels the active run. Returns false, and changes nothing, when no run is active.
    pub async fn stop_run(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.active_run.take() {
            info!(run = run.id, "wizard: stopping run");
            run.cancel();
        }
        self.dispatch(&mut inner, WizardAction::RunStopped).applied()
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(run) = inner.active_run.take() {
            run.cancel();
        }
        inner.in_flight = false;
        inner.epoch += 1;
        self.dispatch(&mut inner, WizardAction::Reset);
    }

    /// Waits until the current run (if any) reaches a terminal status.
    pub async fn wait_for_run(&self) -> RunStatus {
        wait_until_settled(self.run_status.subscribe()).await
    }

    /// Claims the single request slot and returns the epoch the request belongs to.
    async fn begin_request(
        &self,
        command: Command,
        action: Option<WizardAction>,
    ) -> Result<u64, ControllerError> {
        let mut inner = self.inner.lock().await;
        self.gate(&inner, command)?;
        if inner.in_flight {
            return Err(ControllerError::Busy);
        }
        inner.in_flight = true;
        if let Some(action) = action {
            self.dispatch(&mut inner, action);
        }
        Ok(inner.epoch)
    }

    async fn finish_request(
        &self,
        epoch: u64,
    ) -> Result<MutexGuard<'_, ControllerInner>, ControllerError> {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            debug!(epoch, "wizard: discarding response from before a reset");
            return Err(ControllerError::Failed(RESET_WHILE_IN_FLIGHT.into()));
        }
        inner.in_flight = false;
        Ok(inner)
    }

    fn gate(&self, inner: &ControllerInner, command: Command) -> Result<(), ControllerError> {
        if inner.state.allows(command) {
            Ok(())
        } else {
            Err(ControllerError::NotAllowed {
                command,
                stage: inner.state.stage(),
            })
        }
    }

    fn dispatch(&self, inner: &mut ControllerInner, action: WizardAction) -> Transition {
        let before_stage = inner.state.stage();
        let before_log = inner.state.log().len();
        let before_status = inner.state.status_revision();
        let before_run = inner.state.run_status();
        let probed = match &action {
            WizardAction::SessionProbed(readiness) => Some(readiness.clone()),
            _ => None,
        };

        let transition = inner.state.apply(action);
        if !transition.applied() {
            debug!(stage = before_stage.label(), "wizard: action ignored");
            return transition;
        }

        let stage = inner.state.stage();
        if stage != before_stage {
            info!(from = before_stage.label(), to = stage.label(), "wizard: stage changed");
            let _ = self.events.send(WizardEvent::StageChanged {
                from: before_stage,
                to: stage,
            });
        }
        let log = inner.state.log();
        let first_new = if log.len() >= before_log { before_log } else { 0 };
        for entry in &log[first_new..] {
            let _ = self.events.send(WizardEvent::LogAppended(entry.clone()));
        }
        if inner.state.status_revision() != before_status {
            if let Some(status) = inner.state.status() {
                let _ = self.events.send(WizardEvent::Status(status.to_string()));
            }
        }
        if let Some(readiness) = probed {
            let _ = self.events.send(WizardEvent::SessionChecked(readiness));
        }

        let run_status = inner.state.run_status();
        if run_status != before_run {
            self.run_status.send_replace(run_status);
            if run_status.is_terminal() {
                inner.active_run = None;
                let _ = self.events.send(WizardEvent::RunFinished(run_status));
            }
        }
        transition
    }
}

impl Drop for WizardController {
    fn drop(&mut self) {
        if let Some(run) = self.inner.get_mut().active_run.take() {
            debug!(run = run.id, "wizard: controller dropped, cancelling run");
            run.cancel();
        }
    }
}

#[async_trait]
impl RunSink for WizardController {
    async fn deliver(&self, run: RunId, event: RunEvent) {
        let mut inner = self.inner.lock().await;
        if inner.active_run.as_ref().map(|active| active.id) != Some(run) {
            debug!(run, "wizard: dropping event from a run that is no longer active");
            return;
        }
        self.dispatch(&mut inner, WizardAction::Run(event));
    }
}

pub(crate) async fn wait_until_settled(mut rx: watch::Receiver<RunStatus>) -> RunStatus {
    loop {
        let status = *rx.borrow_and_update();
        if status != RunStatus::Active {
            return status;
        }
        if rx.changed().await.is_err() {
            return status;
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
