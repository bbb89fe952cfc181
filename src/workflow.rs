//! Upload → generate workflow for one form session.
//!
//! All state lives in [`WorkflowState`] behind a single lock that is never held
//! across an await. Each accepted submit gets a fresh request id, and a step's
//! outcome only lands if that id is still the latest one.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::Transport,
    error::{ApiError, ValidationError},
    models::{DesignDraft, FormValues, GenerationResult, ImageFile, Style, WorkflowKind},
    preview::{PreviewHandle, PreviewStore},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Uploading,
    Generating,
    Succeeded(GenerationResult),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Idle,
    Uploading,
    Generating,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn name(&self) -> PhaseName {
        match self {
            Phase::Idle => PhaseName::Idle,
            Phase::Uploading => PhaseName::Uploading,
            Phase::Generating => PhaseName::Generating,
            Phase::Succeeded(_) => PhaseName::Succeeded,
            Phase::Failed(_) => PhaseName::Failed,
        }
    }
}

/// The selected file and the preview derived from it; replacing one replaces both.
struct Selection {
    file: ImageFile,
    preview: PreviewHandle,
}

pub struct WorkflowState {
    kind: WorkflowKind,
    phase: Phase,
    selection: Option<Selection>,
    form: FormValues,
    styles: Vec<Style>,
    latest_request: u64,
    updated_at: DateTime<Utc>,
}

impl WorkflowState {
    fn new(kind: WorkflowKind) -> Self {
        Self {
            kind,
            phase: Phase::Idle,
            selection: None,
            form: FormValues::defaults(kind),
            styles: Vec::new(),
            latest_request: 0,
            updated_at: Utc::now(),
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }
}

/// Read-only view of the state handed to the view layer.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub kind: WorkflowKind,
    pub phase: PhaseName,
    pub error: Option<String>,
    pub result: Option<GenerationResult>,
    pub file_name: Option<String>,
    pub preview_url: Option<String>,
    pub form: FormValues,
    pub styles: Vec<Style>,
    pub request_id: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Succeeded(GenerationResult),
    Failed(String),
    /// A newer submit started before this one finished; its outcome was dropped.
    Superseded,
}

struct Submission {
    id: u64,
    file: ImageFile,
    draft: DesignDraft,
}

pub struct WorkflowController {
    transport: Arc<dyn Transport>,
    previews: PreviewStore,
    timeout: Duration,
    state: Mutex<WorkflowState>,
}

impl WorkflowController {
    pub fn new(kind: WorkflowKind, transport: Arc<dyn Transport>, previews: PreviewStore, timeout: Duration) -> Self {
        Self { transport, previews, timeout, state: Mutex::new(WorkflowState::new(kind)) }
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.state.lock();
        let (result, error) = match &state.phase {
            Phase::Succeeded(result) => (Some(result.clone()), None),
            Phase::Failed(message) => (None, Some(message.clone())),
            _ => (None, None),
        };
        WorkflowSnapshot {
            kind: state.kind,
            phase: state.phase.name(),
            error,
            result,
            file_name: state.selection.as_ref().map(|s| s.file.name.clone()),
            preview_url: state.selection.as_ref().map(|s| s.preview.url()),
            form: state.form.clone(),
            styles: state.styles.clone(),
            request_id: state.latest_request,
            updated_at: state.updated_at,
        }
    }

    /// Replaces the selected file. Clears a finished result or error, but leaves an
    /// in-flight request alone.
    pub fn select_file(&self, name: impl Into<String>, bytes: impl Into<Bytes>) -> Result<(), ValidationError> {
        let file = ImageFile::sniff(name, bytes)?;
        let preview = self.previews.create(&file);
        info!("🖼️ Selected {} ({}, {} bytes)", file.name, file.mime, file.bytes.len());

        let mut state = self.state.lock();
        state.selection = Some(Selection { file, preview });
        if matches!(state.phase, Phase::Succeeded(_) | Phase::Failed(_)) {
            state.set_phase(Phase::Idle);
        } else {
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn set_field(&self, name: &str, value: impl Into<String>) -> Result<(), ValidationError> {
        let mut state = self.state.lock();
        if state.kind.field(name).is_none() {
            return Err(ValidationError::UnknownField(name.to_string()));
        }
        state.form.set(name, value);
        state.updated_at = Utc::now();
        Ok(())
    }

    /// Fetches the style presets. Floor plan forms preselect the first one.
    pub async fn load_styles(&self) -> Result<usize, ApiError> {
        let styles = self.bounded(self.transport.list_styles()).await.map_err(|e| {
            warn!("⚠️ Failed to load design styles: {}", e);
            e
        })?;

        let mut state = self.state.lock();
        if state.kind == WorkflowKind::FloorPlan {
            if let Some(first) = styles.first() {
                state.form.set("style", first.id.to_string());
            }
        }
        let count = styles.len();
        state.styles = styles;
        state.updated_at = Utc::now();
        Ok(count)
    }

    /// Runs one submission to completion.
    pub async fn submit(&self) -> Result<SubmitOutcome, ValidationError> {
        let submission = self.begin()?;
        Ok(self.run(submission).await)
    }

    /// Validates synchronously, then runs the submission on the runtime.
    pub fn spawn_submit(self: &Arc<Self>) -> Result<u64, ValidationError> {
        let submission = self.begin()?;
        let id = submission.id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(submission).await;
        });
        Ok(id)
    }

    /// Drops the selection (and its preview) and invalidates any in-flight request.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.selection = None;
        state.latest_request += 1;
        state.set_phase(Phase::Idle);
    }

    /// True when nothing has changed since `cutoff` and no submission is in flight.
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        !matches!(state.phase, Phase::Uploading | Phase::Generating) && state.updated_at < cutoff
    }

    fn begin(&self) -> Result<Submission, ValidationError> {
        let mut state = self.state.lock();
        let checked = match state.selection.as_ref() {
            None => Err(ValidationError::MissingFile),
            Some(selection) => {
                DesignDraft::from_form(state.kind, &state.form, &state.styles).map(|draft| (selection.file.clone(), draft))
            }
        };
        let (file, draft) = checked.map_err(|e| {
            warn!("⚠️ Submit rejected: {}", e);
            e
        })?;

        state.latest_request += 1;
        state.set_phase(Phase::Uploading);
        let id = state.latest_request;
        info!(request_id = id, kind = ?state.kind, "🚀 Submission accepted");
        Ok(Submission { id, file, draft })
    }

    async fn run(&self, submission: Submission) -> SubmitOutcome {
        let Submission { id, file, draft } = submission;

        let upload = match self.bounded(self.transport.upload_image(&file)).await {
            Ok(upload) => upload,
            Err(e) => return self.fail(id, e),
        };
        if !self.apply(id, Phase::Generating) {
            return SubmitOutcome::Superseded;
        }

        let request = draft.into_request(upload.url, file);
        match self.bounded(self.transport.generate(&request)).await {
            Ok(result) => {
                if self.apply(id, Phase::Succeeded(result.clone())) {
                    info!(request_id = id, images = result.images.len(), "✅ Generation finished");
                    SubmitOutcome::Succeeded(result)
                } else {
                    SubmitOutcome::Superseded
                }
            }
            Err(e) => self.fail(id, e),
        }
    }

    fn fail(&self, id: u64, error: ApiError) -> SubmitOutcome {
        let message = error.to_string();
        if self.apply(id, Phase::Failed(message.clone())) {
            warn!(request_id = id, "❌ Submission failed: {}", message);
            SubmitOutcome::Failed(message)
        } else {
            SubmitOutcome::Superseded
        }
    }

    /// Moves to `phase` only if `id` is still the latest submission.
    fn apply(&self, id: u64, phase: Phase) -> bool {
        let mut state = self.state.lock();
        if state.latest_request != id {
            info!(request_id = id, latest = state.latest_request, "Discarding stale outcome");
            return false;
        }
        state.set_phase(phase);
        true
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, ApiError>>) -> Result<T, ApiError> {
        tokio::time::timeout(self.timeout, call).await.map_err(|_| ApiError::Timeout(self.timeout))?
    }
}
