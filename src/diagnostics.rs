//! Per-job status and absorbed-error diagnostics.
//!
//! Chunk-level failures never fail a document; they are recorded here and
//! surfaced through [`JobStatus`] alongside stage progress and counts. The
//! status handle is shared between the running pipeline and whatever is
//! polling it (an HTTP status endpoint, a test).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::LoomError;

/// The pipeline stages as reported to job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Pending,
    Chunking,
    Coref,
    Linking,
    Claims,
    Themes,
    Governance,
    Persistence,
    Done,
    Failed,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Pending => "pending",
            StageName::Chunking => "chunking",
            StageName::Coref => "coref",
            StageName::Linking => "linking",
            StageName::Claims => "claims",
            StageName::Themes => "themes",
            StageName::Governance => "governance",
            StageName::Persistence => "persistence",
            StageName::Done => "done",
            StageName::Failed => "failed",
        }
    }
}

/// Per-stage output counts shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub chunks: usize,
    pub links: usize,
    pub claims: usize,
    pub themes: usize,
}

/// Taxonomy kind plus a human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl From<&LoomError> for JobError {
    fn from(err: &LoomError) -> Self {
        JobError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of one ingestion job's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub stage: StageName,
    /// Fraction of the current document processed, in [0, 1].
    pub progress: f32,
    pub counts: JobCounts,
    pub review_queue_size: usize,
    pub error: Option<JobError>,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus {
            stage: StageName::Pending,
            progress: 0.0,
            counts: JobCounts::default(),
            review_queue_size: 0,
            error: None,
        }
    }
}

/// Shared handle the pipeline writes and callers poll.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<JobStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> JobStatus {
        self.inner.read().clone()
    }

    pub fn set_stage(&self, stage: StageName) {
        let mut status = self.inner.write();
        status.stage = stage;
        status.progress = 0.0;
    }

    pub fn set_progress(&self, progress: f32) {
        self.inner.write().progress = progress.clamp(0.0, 1.0);
    }

    pub fn update_counts(&self, update: impl FnOnce(&mut JobCounts)) {
        update(&mut self.inner.write().counts);
    }

    pub fn set_review_queue_size(&self, size: usize) {
        self.inner.write().review_queue_size = size;
    }

    pub fn record_failure(&self, err: &LoomError) {
        let mut status = self.inner.write();
        status.stage = StageName::Failed;
        status.error = Some(JobError::from(err));
    }

    pub fn finish(&self) {
        let mut status = self.inner.write();
        status.stage = StageName::Done;
        status.progress = 1.0;
    }
}

/// One absorbed failure, attributed to a chunk and stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDiagnostic {
    pub chunk_id: String,
    pub stage: StageName,
    pub message: String,
}

/// Collects everything that went wrong but did not fail the document.
#[derive(Debug, Clone, Default)]
pub struct JobDiagnostics {
    entries: Vec<ChunkDiagnostic>,
}

impl JobDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, chunk_id: impl Into<String>, stage: StageName, message: impl Into<String>) {
        let entry = ChunkDiagnostic {
            chunk_id: chunk_id.into(),
            stage,
            message: message.into(),
        };
        tracing::warn!(
            chunk_id = %entry.chunk_id,
            stage = entry.stage.as_str(),
            "{}",
            entry.message
        );
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ChunkDiagnostic] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_handle_round_trips() {
        let handle = StatusHandle::new();
        handle.set_stage(StageName::Linking);
        handle.set_progress(0.5);
        handle.update_counts(|counts| counts.links += 3);

        let status = handle.snapshot();
        assert_eq!(status.stage, StageName::Linking);
        assert_eq!(status.progress, 0.5);
        assert_eq!(status.counts.links, 3);
        assert!(status.error.is_none());
    }

    #[test]
    fn failure_records_taxonomy_kind() {
        let handle = StatusHandle::new();
        handle.record_failure(&LoomError::Input("empty document".to_string()));
        let status = handle.snapshot();
        assert_eq!(status.stage, StageName::Failed);
        assert_eq!(status.error.unwrap().kind, "input");
    }

    #[test]
    fn progress_is_clamped() {
        let handle = StatusHandle::new();
        handle.set_progress(7.0);
        assert_eq!(handle.snapshot().progress, 1.0);
    }
}
