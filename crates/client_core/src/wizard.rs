//! Step state machine for the test wizard.
//!
//! [`WizardState::apply`] is the only way the state changes. Actions that are not valid
//! for the current stage are ignored, which gives UI controls a simple contract: ask
//! [`WizardState::allows`] before enabling a control, and treat a stale click as a no-op.

use shared::{
    domain::{
        LogEntry, SegmentParameters, SessionReadiness, WizardStage, DEFAULT_SAVE_FILENAME,
    },
    protocol::{FileInfo, ProcessingInfo, ValidationInfo},
};

use crate::stream::{RunEvent, RunLog, RunStatus};

/// User-facing controls gated by the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PickFile,
    EditParameters,
    EditSaveFilename,
    Validate,
    Process,
    Run,
    Stop,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WizardAction {
    UploadStarted,
    UploadSucceeded(FileInfo),
    /// Pre-segmented dataset accepted; no validation or processing needed.
    DatasetUploaded { total_count: u64 },
    UploadFailed(String),
    ParametersChanged(SegmentParameters),
    SaveFilenameChanged(String),
    ValidationSucceeded(ValidationInfo),
    ValidationRejected(String),
    ValidationFailed(String),
    ProcessingStarted,
    ProcessingSucceeded(ProcessingInfo),
    ProcessingFailed(String),
    RunStarted,
    Run(RunEvent),
    RunStopped,
    SessionProbed(SessionReadiness),
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
}

impl Transition {
    pub fn applied(self) -> bool {
        self == Transition::Applied
    }
}

#[derive(Debug, Clone)]
pub struct WizardState {
    stage: WizardStage,
    file: Option<FileInfo>,
    dataset_count: Option<u64>,
    parameters: SegmentParameters,
    save_filename: String,
    validation: Option<ValidationInfo>,
    processing: Option<ProcessingInfo>,
    run: RunLog,
    session: Option<SessionReadiness>,
    status: Option<String>,
    /// Bumped on every status write, including repeats of the same text.
    status_revision: u64,
}

impl Default for WizardState {
    fn default() -> Self {
        Self {
            stage: WizardStage::Upload,
            file: None,
            dataset_count: None,
            parameters: SegmentParameters::default(),
            save_filename: DEFAULT_SAVE_FILENAME.to_string(),
            validation: None,
            processing: None,
            run: RunLog::default(),
            session: None,
            status: None,
            status_revision: 0,
        }
    }
}

impl WizardState {
    pub fn stage(&self) -> WizardStage {
        self.stage
    }

    pub fn file(&self) -> Option<&FileInfo> {
        self.file.as_ref()
    }

    pub fn dataset_count(&self) -> Option<u64> {
        self.dataset_count
    }

    pub fn parameters(&self) -> &SegmentParameters {
        &self.parameters
    }

    pub fn save_filename(&self) -> &str {
        &self.save_filename
    }

    pub fn validation(&self) -> Option<&ValidationInfo> {
        self.validation.as_ref()
    }

    pub fn processing(&self) -> Option<&ProcessingInfo> {
        self.processing.as_ref()
    }

    pub fn log(&self) -> &[LogEntry] {
        self.run.entries()
    }

    pub fn run_status(&self) -> RunStatus {
        self.run.status()
    }

    pub fn session(&self) -> Option<&SessionReadiness> {
        self.session.as_ref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub(crate) fn status_revision(&self) -> u64 {
        self.status_revision
    }

    pub fn allows(&self, command: Command) -> bool {
        use WizardStage::*;
        match command {
            Command::PickFile => matches!(self.stage, Upload | ParametersPending),
            Command::EditParameters | Command::Validate => {
                matches!(self.stage, ParametersPending | Validated)
            }
            Command::EditSaveFilename => self.stage == Validated,
            Command::Process => self.stage == Validated,
            Command::Run => self.stage == ReadyToRun,
            Command::Stop => self.stage == Running,
            Command::Reset => true,
        }
    }

    pub fn apply(&mut self, action: WizardAction) -> Transition {
        use WizardStage::*;
        match action {
            WizardAction::UploadStarted => {
                if !self.allows(Command::PickFile) {
                    return Transition::Ignored;
                }
                self.stage = Upload;
                self.file = None;
                self.dataset_count = None;
                self.validation = None;
                self.processing = None;
                self.run.clear();
                self.set_status("uploading...");
            }
            WizardAction::UploadSucceeded(file) => {
                if self.stage != Upload {
                    return Transition::Ignored;
                }
                self.parameters = SegmentParameters::for_upload(file.max_possible_segments);
                self.set_status(format!("file uploaded: {}", file.filename));
                self.file = Some(file);
                self.stage = ParametersPending;
            }
            WizardAction::DatasetUploaded { total_count } => {
                if self.stage != Upload {
                    return Transition::Ignored;
                }
                self.dataset_count = Some(total_count);
                self.set_status(format!("dataset uploaded: {total_count} samples"));
                self.stage = ReadyToRun;
            }
            WizardAction::UploadFailed(message) => {
                if self.stage != Upload {
                    return Transition::Ignored;
                }
                self.set_status(format!("upload failed: {message}"));
            }
            WizardAction::ParametersChanged(parameters) => {
                if !self.allows(Command::EditParameters) {
                    return Transition::Ignored;
                }
                if parameters != self.parameters {
                    self.parameters = parameters;
                    self.validation = None;
                    self.stage = ParametersPending;
                }
            }
            WizardAction::SaveFilenameChanged(name) => {
                if !self.allows(Command::EditSaveFilename) {
                    return Transition::Ignored;
                }
                self.save_filename = name;
            }
            WizardAction::ValidationSucceeded(info) => {
                if !self.allows(Command::Validate) {
                    return Transition::Ignored;
                }
                self.validation = Some(info);
                self.stage = Validated;
                self.set_status("parameters are valid; processing can start");
            }
            WizardAction::ValidationRejected(message) => {
                if !self.allows(Command::Validate) {
                    return Transition::Ignored;
                }
                self.validation = None;
                self.stage = ParametersPending;
                self.set_status(format!("validation failed: {message}"));
            }
            WizardAction::ValidationFailed(message) => {
                if !self.allows(Command::Validate) {
                    return Transition::Ignored;
                }
                self.validation = None;
                self.stage = ParametersPending;
                self.set_status(message);
            }
            WizardAction::ProcessingStarted => {
                if self.stage != Validated {
                    return Transition::Ignored;
                }
                self.stage = Processing;
                self.set_status("creating segment file...");
            }
            WizardAction::ProcessingSucceeded(info) => {
                if self.stage != Processing {
                    return Transition::Ignored;
                }
                let mut status = format!(
                    "segment file created; segments: {}",
                    info.segments_created
                );
                if let Some(path) = &info.save_path {
                    status.push_str(&format!(", saved to {path}"));
                }
                self.set_status(status);
                self.processing = Some(info);
                self.stage = ReadyToRun;
            }
            WizardAction::ProcessingFailed(message) => {
                if self.stage != Processing {
                    return Transition::Ignored;
                }
                self.stage = Validated;
                self.set_status(format!("processing failed: {message}"));
            }
            WizardAction::RunStarted => {
                if self.stage != ReadyToRun {
                    return Transition::Ignored;
                }
                self.run.begin();
                self.stage = Running;
                self.set_status("run in progress...");
            }
            WizardAction::Run(event) => {
                if self.stage != Running || !self.run.apply(&event) {
                    return Transition::Ignored;
                }
                match event {
                    RunEvent::Line(_) => {}
                    RunEvent::Completed { .. } => {
                        self.stage = Finished;
                        self.set_status("run completed");
                    }
                    RunEvent::Failed(_) => {
                        self.stage = ReadyToRun;
                        self.set_status("run failed; it can be started again");
                    }
                }
            }
            WizardAction::RunStopped => {
                if self.stage != Running || !self.run.stop() {
                    return Transition::Ignored;
                }
                self.stage = ReadyToRun;
                self.set_status("run stopped");
            }
            WizardAction::SessionProbed(readiness) => {
                self.session = Some(readiness);
            }
            WizardAction::Reset => {
                let session = self.session.take();
                *self = WizardState {
                    session,
                    ..WizardState::default()
                };
            }
        }
        Transition::Applied
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = Some(status.into());
        self.status_revision += 1;
    }
}

#[cfg(test)]
#[path = "tests/wizard_tests.rs"]
mod tests;
