//! Message types for communication between the task queue and a worker

use image::RgbImage;
use uuid::Uuid;

use crate::pipeline::{JobConfig, OcrResult, ProgressUpdate, Stage};

/// Job identifier
pub type JobId = Uuid;

/// Messages sent from the queue to a worker
#[derive(Debug)]
pub enum WorkerRequest {
    /// Load models into the worker
    Initialize,
    /// Run one page
    OcrProcess {
        id: JobId,
        image: RgbImage,
        config: JobConfig,
    },
    /// Stop the worker; no response
    Terminate,
}

/// Messages sent from a worker back to the queue
#[derive(Debug, Clone)]
pub enum WorkerResponse {
    /// Models are loaded
    Initialized,
    /// Models could not be loaded
    InitializationFailed { error: String },
    /// Progress for the running job
    OcrProgress {
        id: JobId,
        stage: Stage,
        progress: f32,
        message: String,
    },
    /// The running job finished
    OcrComplete { id: JobId, result: Box<OcrResult> },
    /// The running job failed in `stage`
    OcrError {
        id: JobId,
        error: String,
        stage: String,
    },
}

impl WorkerResponse {
    /// Job this message belongs to, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerResponse::OcrProgress { id, .. }
            | WorkerResponse::OcrComplete { id, .. }
            | WorkerResponse::OcrError { id, .. } => Some(*id),
            WorkerResponse::Initialized | WorkerResponse::InitializationFailed { .. } => None,
        }
    }

    /// Whether this message ends its job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerResponse::OcrComplete { .. } | WorkerResponse::OcrError { .. }
        )
    }
}

/// Events delivered to whoever submitted a job
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress(ProgressUpdate),
    Completed(Box<OcrResult>),
    Failed { error: String, stage: String },
    /// Rejected by a cancel before it finished
    Cancelled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress(_))
    }
}

/// Where a live job is
///
/// Finished jobs leave the queue; done, failed and cancelled are reported
/// once through the terminal `JobEvent` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_job_ids() {
        let id = Uuid::new_v4();
        let progress = WorkerResponse::OcrProgress {
            id,
            stage: Stage::Detecting,
            progress: 0.05,
            message: String::new(),
        };
        assert_eq!(progress.job_id(), Some(id));
        assert!(!progress.is_terminal());

        let error = WorkerResponse::OcrError {
            id,
            error: "boom".to_string(),
            stage: "detecting".to_string(),
        };
        assert!(error.is_terminal());

        assert_eq!(WorkerResponse::Initialized.job_id(), None);
    }

    #[test]
    fn test_job_event_terminality() {
        assert!(JobEvent::Cancelled.is_terminal());
        assert!(!JobEvent::Progress(ProgressUpdate {
            stage: Stage::Done,
            progress: 1.0,
            message: String::new(),
        })
        .is_terminal());
    }
}
