//! Isolated worker context
//!
//! A worker owns one model set and runs jobs one at a time on its own thread.
//! It talks to the queue only through request/response channels.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{WorkerRequest, WorkerResponse};
use crate::config::AppConfig;
use crate::pipeline::{CancelToken, OcrPipeline, PipelineError, Stage};
use crate::vision::ModelProvider;

/// Handle to a running worker thread
pub struct WorkerContext {
    generation: u64,
    requests: Sender<WorkerRequest>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerContext {
    /// Start a worker thread and ask it to load models
    pub fn spawn(
        generation: u64,
        provider: Arc<dyn ModelProvider>,
        config: Arc<AppConfig>,
    ) -> Result<(Self, Receiver<WorkerResponse>)> {
        let (requests, request_rx) = unbounded();
        let (response_tx, responses) = unbounded();
        let cancel = CancelToken::new();

        let worker_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ocr-worker-{}", generation))
            .spawn(move || {
                info!("Worker generation {} starting...", generation);
                run_worker(provider, &config, request_rx, response_tx, worker_cancel);
                info!("Worker generation {} exiting...", generation);
            })
            .context("Failed to spawn worker thread")?;

        requests
            .send(WorkerRequest::Initialize)
            .context("Worker exited before initialization")?;

        Ok((
            Self {
                generation,
                requests,
                cancel,
                handle: Some(handle),
            },
            responses,
        ))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand a request to the worker; gives it back if the worker is gone
    pub fn send(&self, request: WorkerRequest) -> Result<(), WorkerRequest> {
        self.requests.send(request).map_err(|e| e.into_inner())
    }

    /// Cancel whatever the worker is doing and let the thread wind down
    pub fn teardown(self) {
        debug!("Tearing down worker generation {}", self.generation);
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        // The thread cannot be interrupted mid-inference; it stops at its
        // next checkpoint and is detached rather than joined
        self.cancel.cancel();
        let _ = self.requests.send(WorkerRequest::Terminate);
        self.handle.take();
    }
}

fn run_worker(
    provider: Arc<dyn ModelProvider>,
    config: &AppConfig,
    requests: Receiver<WorkerRequest>,
    responses: Sender<WorkerResponse>,
    cancel: CancelToken,
) {
    let load = || -> Result<OcrPipeline, PipelineError> {
        provider
            .load()
            .map(|models| OcrPipeline::new(models, config))
            .map_err(|e| PipelineError::Initialization(format!("{:#}", e)))
    };

    let mut pipeline: Option<OcrPipeline> = None;

    for request in requests.iter() {
        let response = match request {
            WorkerRequest::Initialize => match load() {
                Ok(p) => {
                    pipeline = Some(p);
                    WorkerResponse::Initialized
                }
                Err(e) => {
                    warn!("Model initialization failed: {}", e);
                    WorkerResponse::InitializationFailed { error: e.to_string() }
                }
            },
            WorkerRequest::OcrProcess { id, image, config: job } => {
                if cancel.is_cancelled() {
                    break;
                }

                if pipeline.is_none() {
                    match load() {
                        Ok(p) => pipeline = Some(p),
                        Err(e) => {
                            let _ = responses.send(WorkerResponse::OcrError {
                                id,
                                error: e.to_string(),
                                stage: e.stage_name().to_string(),
                            });
                            continue;
                        }
                    }
                }
                let Some(active) = pipeline.as_mut() else {
                    continue;
                };

                let current = Cell::new(Stage::Initializing);
                let progress_tx = responses.clone();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    active.process(&image, &job, &cancel, |update| {
                        current.set(update.stage);
                        let _ = progress_tx.send(WorkerResponse::OcrProgress {
                            id,
                            stage: update.stage,
                            progress: update.progress,
                            message: update.message,
                        });
                    })
                }));

                match outcome {
                    Ok(Ok(result)) => WorkerResponse::OcrComplete {
                        id,
                        result: Box::new(result),
                    },
                    Ok(Err(e)) => {
                        debug!("Job {} failed: {}", id, e);
                        WorkerResponse::OcrError {
                            id,
                            error: e.to_string(),
                            stage: e.stage_name().to_string(),
                        }
                    }
                    Err(payload) => {
                        // Models may be left inconsistent; reload for the next job
                        pipeline = None;
                        let message = panic_message(payload.as_ref());
                        error!("Worker panicked during job {}: {}", id, message);
                        WorkerResponse::OcrError {
                            id,
                            error: format!("worker panicked: {}", message),
                            stage: current.get().as_str().to_string(),
                        }
                    }
                }
            }
            WorkerRequest::Terminate => break,
        };

        if responses.send(response).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobConfig;
    use crate::test_support::FakeProvider;
    use image::{Rgb, RgbImage};
    use std::time::Duration;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn config() -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.detection.input_size = 100;
        Arc::new(config)
    }

    fn page() -> RgbImage {
        RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]))
    }

    #[test]
    fn test_worker_initializes_and_processes() {
        let (worker, responses) =
            WorkerContext::spawn(1, Arc::new(FakeProvider::single_region()), config()).unwrap();
        assert_eq!(worker.generation(), 1);

        assert!(matches!(
            responses.recv_timeout(TIMEOUT).unwrap(),
            WorkerResponse::Initialized
        ));

        let id = Uuid::new_v4();
        worker
            .send(WorkerRequest::OcrProcess {
                id,
                image: page(),
                config: JobConfig::default(),
            })
            .unwrap();

        let mut saw_progress = false;
        loop {
            let response = responses.recv_timeout(TIMEOUT).unwrap();
            assert_eq!(response.job_id(), Some(id));
            match response {
                WorkerResponse::OcrProgress { .. } => saw_progress = true,
                WorkerResponse::OcrComplete { result, .. } => {
                    assert_eq!(result.txt.as_deref(), Some("一"));
                    break;
                }
                other => panic!("unexpected response {:?}", other),
            }
        }
        assert!(saw_progress);
    }

    #[test]
    fn test_initialization_failure_is_reported_per_job() {
        let provider = FakeProvider::single_region().failing("det.onnx not found");
        let (worker, responses) = WorkerContext::spawn(1, Arc::new(provider), config()).unwrap();

        match responses.recv_timeout(TIMEOUT).unwrap() {
            WorkerResponse::InitializationFailed { error } => assert!(error.contains("det.onnx")),
            other => panic!("unexpected response {:?}", other),
        }

        let id = Uuid::new_v4();
        worker
            .send(WorkerRequest::OcrProcess {
                id,
                image: page(),
                config: JobConfig::default(),
            })
            .unwrap();

        match responses.recv_timeout(TIMEOUT).unwrap() {
            WorkerResponse::OcrError { id: got, stage, error } => {
                assert_eq!(got, id);
                assert_eq!(stage, "initialization");
                assert!(error.contains("det.onnx"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_dropping_context_stops_worker() {
        let (worker, responses) =
            WorkerContext::spawn(1, Arc::new(FakeProvider::single_region()), config()).unwrap();
        let _ = responses.recv_timeout(TIMEOUT).unwrap();

        worker.teardown();

        // The worker's sender goes away once the thread exits
        assert!(matches!(
            responses.recv_timeout(TIMEOUT),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
