//! Single-slot task queue
//!
//! Jobs wait in an unordered map and are dispatched one at a time, oldest
//! submission first, to the current worker context. Cancelling replaces the
//! context; responses from a replaced context are dropped by generation.

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::RgbImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::WorkerContext;
use super::messages::{JobEvent, JobId, JobState, WorkerRequest, WorkerResponse};
use crate::config::AppConfig;
use crate::pipeline::{JobConfig, OcrResult, ProgressUpdate};
use crate::vision::ModelProvider;

struct PendingJob {
    image: RgbImage,
    config: JobConfig,
    submitted_at: Instant,
    sequence: u64,
    events: Sender<JobEvent>,
}

struct RunningJob {
    id: JobId,
    events: Sender<JobEvent>,
}

struct QueueState {
    pending: HashMap<JobId, PendingJob>,
    running: Option<RunningJob>,
    worker: Option<WorkerContext>,
    generation: u64,
    next_sequence: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    provider: Arc<dyn ModelProvider>,
    config: Arc<AppConfig>,
}

/// Accepts OCR jobs and runs them one at a time on a worker thread
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Create the queue and start a worker loading models
    pub fn new(provider: Arc<dyn ModelProvider>, config: AppConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                running: None,
                worker: None,
                generation: 0,
                next_sequence: 0,
            }),
            provider,
            config: Arc::new(config),
        });

        {
            let mut state = inner.state.lock();
            respawn(&inner, &mut state)?;
        }

        Ok(Self { inner })
    }

    /// Queue a page; events for it arrive on the returned ticket
    pub fn submit(&self, image: RgbImage, config: JobConfig) -> Result<JobTicket> {
        let id = Uuid::new_v4();
        let (events_tx, events) = unbounded();

        let mut state = self.inner.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.insert(
            id,
            PendingJob {
                image,
                config,
                submitted_at: Instant::now(),
                sequence,
                events: events_tx,
            },
        );
        debug!("Queued job {} ({} pending)", id, state.pending.len());

        dispatch(&self.inner, &mut state)?;
        Ok(JobTicket { id, events })
    }

    /// Reject the running job and restart the worker; queued jobs stay queued
    pub fn cancel_current(&self) -> Result<Option<JobId>> {
        let mut state = self.inner.state.lock();
        let cancelled = state.running.take().map(|job| {
            let _ = job.events.send(JobEvent::Cancelled);
            job.id
        });
        if let Some(id) = cancelled {
            info!("Cancelled running job {}", id);
        }

        respawn(&self.inner, &mut state)?;
        dispatch(&self.inner, &mut state)?;
        Ok(cancelled)
    }

    /// Reject every queued and running job, then restart the worker
    pub fn cancel_all(&self) -> Result<usize> {
        let mut state = self.inner.state.lock();
        let mut count = 0;

        if let Some(job) = state.running.take() {
            let _ = job.events.send(JobEvent::Cancelled);
            count += 1;
        }
        for (_, job) in state.pending.drain() {
            let _ = job.events.send(JobEvent::Cancelled);
            count += 1;
        }
        info!("Cancelled {} jobs", count);

        respawn(&self.inner, &mut state)?;
        Ok(count)
    }

    /// Where a job is, or `None` once it has finished or was never queued
    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        let state = self.inner.state.lock();
        if state.running.as_ref().is_some_and(|job| job.id == id) {
            Some(JobState::Running)
        } else if state.pending.contains_key(&id) {
            Some(JobState::Queued)
        } else {
            None
        }
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(worker) = state.worker.take() {
            worker.teardown();
        }
    }
}

/// Replace the worker context with a fresh one under a new generation
fn respawn(inner: &Arc<Inner>, state: &mut QueueState) -> Result<()> {
    if let Some(old) = state.worker.take() {
        old.teardown();
    }

    state.generation += 1;
    let generation = state.generation;
    let (worker, responses) =
        WorkerContext::spawn(generation, inner.provider.clone(), inner.config.clone())?;
    state.worker = Some(worker);

    let weak = Arc::downgrade(inner);
    std::thread::Builder::new()
        .name(format!("ocr-router-{}", generation))
        .spawn(move || route_responses(weak, generation, responses))?;

    debug!("Worker generation {} started", generation);
    Ok(())
}

/// Forward one worker generation's responses until it goes away
fn route_responses(inner: Weak<Inner>, generation: u64, responses: Receiver<WorkerResponse>) {
    for response in responses.iter() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        handle_response(&inner, generation, response);
    }
    debug!("Router for generation {} exiting", generation);
}

fn handle_response(inner: &Arc<Inner>, generation: u64, response: WorkerResponse) {
    let mut state = inner.state.lock();
    if generation != state.generation {
        debug!("Dropping message from retired worker generation {}", generation);
        return;
    }

    let running_id = state.running.as_ref().map(|job| job.id);
    if let Some(id) = response.job_id() {
        if running_id != Some(id) {
            debug!("Ignoring message for job {} that is not running", id);
            return;
        }
    }

    match response {
        WorkerResponse::Initialized => info!("Worker generation {} ready", generation),
        WorkerResponse::InitializationFailed { error } => {
            warn!("Worker generation {} could not load models: {}", generation, error)
        }
        WorkerResponse::OcrProgress {
            stage,
            progress,
            message,
            ..
        } => {
            if let Some(job) = &state.running {
                let _ = job.events.send(JobEvent::Progress(ProgressUpdate {
                    stage,
                    progress,
                    message,
                }));
            }
        }
        WorkerResponse::OcrComplete { id, result } => {
            if let Some(job) = state.running.take() {
                info!("Job {} complete", id);
                let _ = job.events.send(JobEvent::Completed(result));
            }
        }
        WorkerResponse::OcrError { id, error, stage } => {
            if let Some(job) = state.running.take() {
                warn!("Job {} failed during {}: {}", id, stage, error);
                let _ = job.events.send(JobEvent::Failed { error, stage });
            }
        }
    }

    if let Err(e) = dispatch(inner, &mut state) {
        warn!("Could not dispatch next job: {:#}", e);
    }
}

/// Start the oldest queued job if the slot is free
fn dispatch(inner: &Arc<Inner>, state: &mut QueueState) -> Result<()> {
    if state.running.is_some() {
        return Ok(());
    }

    let Some(id) = state
        .pending
        .iter()
        .min_by_key(|(_, job)| (job.submitted_at, job.sequence))
        .map(|(id, _)| *id)
    else {
        return Ok(());
    };
    let Some(job) = state.pending.remove(&id) else {
        return Ok(());
    };

    if state.worker.is_none() {
        respawn(inner, state)?;
    }

    let mut request = WorkerRequest::OcrProcess {
        id,
        image: job.image,
        config: job.config,
    };

    // One restart if the worker thread has gone away
    for attempt in 0..2 {
        let sent = match &state.worker {
            Some(worker) => worker.send(request),
            None => Err(request),
        };
        match sent {
            Ok(()) => {
                debug!("Dispatched job {} to generation {}", id, state.generation);
                state.running = Some(RunningJob {
                    id,
                    events: job.events,
                });
                return Ok(());
            }
            Err(returned) => {
                request = returned;
                if attempt == 0 {
                    warn!("Worker generation {} is gone; restarting", state.generation);
                    respawn(inner, state)?;
                }
            }
        }
    }

    let _ = job.events.send(JobEvent::Failed {
        error: "worker unavailable".to_string(),
        stage: "initialization".to_string(),
    });
    bail!("Could not hand job {} to a worker", id)
}

/// Handle to a submitted job
pub struct JobTicket {
    id: JobId,
    events: Receiver<JobEvent>,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Block until the job ends, passing progress to `on_progress`
    pub fn wait_with_progress(self, mut on_progress: impl FnMut(&ProgressUpdate)) -> Result<OcrResult> {
        for event in self.events.iter() {
            match event {
                JobEvent::Progress(update) => on_progress(&update),
                JobEvent::Completed(result) => return Ok(*result),
                JobEvent::Failed { error, stage } => bail!("Job failed during {}: {}", stage, error),
                JobEvent::Cancelled => bail!("Job {} was cancelled", self.id),
            }
        }
        Err(anyhow!("Queue shut down before job {} finished", self.id))
    }

    /// Block until the job ends
    pub fn wait(self) -> Result<OcrResult> {
        self.wait_with_progress(|_| {})
    }

    /// Next event, giving up after `timeout`
    pub fn next_event(&self, timeout: Duration) -> Option<JobEvent> {
        self.events.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{detector_outputs, FakeProvider};
    use image::Rgb;
    use std::sync::atomic::Ordering;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.detection.input_size = 100;
        config
    }

    fn page() -> RgbImage {
        RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]))
    }

    /// Skip progress and return the terminal event
    fn terminal(ticket: &JobTicket) -> JobEvent {
        loop {
            match ticket.next_event(TIMEOUT) {
                Some(JobEvent::Progress(_)) => continue,
                Some(event) => return event,
                None => panic!("no terminal event for job {}", ticket.id()),
            }
        }
    }

    #[test]
    fn test_single_job_completes() {
        let queue = TaskQueue::new(Arc::new(FakeProvider::single_region()), config()).unwrap();
        let ticket = queue.submit(page(), JobConfig::default()).unwrap();

        let result = ticket.wait().unwrap();
        assert_eq!(result.txt.as_deref(), Some("一"));
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_progress_precedes_completion() {
        let queue = TaskQueue::new(Arc::new(FakeProvider::single_region()), config()).unwrap();
        let ticket = queue.submit(page(), JobConfig::default()).unwrap();

        let mut last_progress = 0.0f32;
        let mut updates = 0;
        let result = ticket
            .wait_with_progress(|u| {
                assert!(u.progress >= last_progress);
                last_progress = u.progress;
                updates += 1;
            })
            .unwrap();

        assert!(updates > 0);
        assert_eq!(last_progress, 1.0);
        assert_eq!(result.total_regions, 1);
    }

    #[test]
    fn test_jobs_run_one_at_a_time_in_submission_order() {
        let (gate_tx, gate_rx) = unbounded();
        let provider = FakeProvider::single_region().gated(gate_rx);
        let detector_calls = provider.detector_calls.clone();
        let queue = TaskQueue::new(Arc::new(provider), config()).unwrap();

        let first = queue.submit(page(), JobConfig::default()).unwrap();
        let second = queue.submit(page(), JobConfig::default()).unwrap();

        assert_eq!(queue.job_state(first.id()), Some(JobState::Running));
        assert_eq!(queue.job_state(second.id()), Some(JobState::Queued));
        assert_eq!(queue.queued_len(), 1);

        gate_tx.send(()).unwrap();
        assert!(matches!(terminal(&first), JobEvent::Completed(_)));
        assert_eq!(detector_calls.load(Ordering::SeqCst), 1);

        gate_tx.send(()).unwrap();
        assert!(matches!(terminal(&second), JobEvent::Completed(_)));
        assert_eq!(detector_calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.job_state(second.id()), None);
    }

    #[test]
    fn test_cancel_all_rejects_running_and_queued() {
        let (gate_tx, gate_rx) = unbounded();
        let provider = FakeProvider::single_region().gated(gate_rx);
        let queue = TaskQueue::new(Arc::new(provider), config()).unwrap();

        let first = queue.submit(page(), JobConfig::default()).unwrap();
        let second = queue.submit(page(), JobConfig::default()).unwrap();

        assert_eq!(queue.cancel_all().unwrap(), 2);
        assert!(matches!(terminal(&first), JobEvent::Cancelled));
        assert!(matches!(terminal(&second), JobEvent::Cancelled));
        assert!(!queue.is_busy());
        assert_eq!(queue.queued_len(), 0);

        // The fresh worker still accepts work; the retired one may take a token
        let third = queue.submit(page(), JobConfig::default()).unwrap();
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        assert!(matches!(terminal(&third), JobEvent::Completed(_)));
    }

    #[test]
    fn test_cancel_current_redispatches_queued_job() {
        let (gate_tx, gate_rx) = unbounded();
        let provider = FakeProvider::single_region().gated(gate_rx);
        let loads = provider.loads.clone();
        let queue = TaskQueue::new(Arc::new(provider), config()).unwrap();

        let first = queue.submit(page(), JobConfig::default()).unwrap();
        let second = queue.submit(page(), JobConfig::default()).unwrap();

        assert_eq!(queue.cancel_current().unwrap(), Some(first.id()));
        assert!(matches!(terminal(&first), JobEvent::Cancelled));
        assert_eq!(queue.job_state(second.id()), Some(JobState::Running));

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        assert!(matches!(terminal(&second), JobEvent::Completed(_)));
        assert!(loads.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_failure_does_not_affect_later_jobs() {
        let mut provider = FakeProvider::single_region();
        provider.detector = vec![
            Err("detector crashed".to_string()),
            Ok(detector_outputs(&[(0.0, 0.0, 40.0, 40.0, 0.9)])),
        ];
        let queue = TaskQueue::new(Arc::new(provider), config()).unwrap();

        let first = queue.submit(page(), JobConfig::default()).unwrap();
        let second = queue.submit(page(), JobConfig::default()).unwrap();

        match terminal(&first) {
            JobEvent::Failed { stage, error } => {
                assert_eq!(stage, "detecting");
                assert!(error.contains("detector crashed"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(terminal(&second), JobEvent::Completed(_)));
    }

    #[test]
    fn test_panic_in_job_does_not_affect_later_jobs() {
        let provider = FakeProvider::single_region().panicking(1);
        let loads = provider.loads.clone();
        let queue = TaskQueue::new(Arc::new(provider), config()).unwrap();

        let first = queue.submit(page(), JobConfig::default()).unwrap();
        let second = queue.submit(page(), JobConfig::default()).unwrap();

        match terminal(&first) {
            JobEvent::Failed { stage, error } => {
                assert_eq!(stage, "detecting");
                assert_eq!(error, "worker panicked: engine blew up");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match terminal(&second) {
            JobEvent::Completed(result) => assert_eq!(result.txt.as_deref(), Some("一")),
            other => panic!("unexpected event {:?}", other),
        }

        // Models are reloaded after the panic
        assert!(loads.load(Ordering::SeqCst) >= 2);
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_initialization_failure_fails_job() {
        let provider = FakeProvider::single_region().failing("rec.onnx not found");
        let queue = TaskQueue::new(Arc::new(provider), config()).unwrap();

        let ticket = queue.submit(page(), JobConfig::default()).unwrap();
        match terminal(&ticket) {
            JobEvent::Failed { stage, error } => {
                assert_eq!(stage, "initialization");
                assert!(error.contains("rec.onnx"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_stale_and_unknown_responses_are_ignored() {
        let (gate_tx, gate_rx) = unbounded();
        let provider = FakeProvider::single_region().gated(gate_rx);
        let queue = TaskQueue::new(Arc::new(provider), config()).unwrap();
        let ticket = queue.submit(page(), JobConfig::default()).unwrap();

        let fake_result = || Box::new(OcrResult::new(Vec::new(), 0, 0, 0, Vec::new()));
        let generation = queue.inner.state.lock().generation;

        // Retired generation
        handle_response(
            &queue.inner,
            generation - 1,
            WorkerResponse::OcrComplete {
                id: ticket.id(),
                result: fake_result(),
            },
        );
        // Unknown job
        handle_response(
            &queue.inner,
            generation,
            WorkerResponse::OcrComplete {
                id: Uuid::new_v4(),
                result: fake_result(),
            },
        );
        assert_eq!(queue.job_state(ticket.id()), Some(JobState::Running));

        gate_tx.send(()).unwrap();
        match terminal(&ticket) {
            JobEvent::Completed(result) => assert_eq!(result.total_regions, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
