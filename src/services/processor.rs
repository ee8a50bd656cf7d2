//! Drives queued jobs through the generation backend.
//!
//! On `init` the processor settles PROCESSING jobs left over from an earlier
//! load (resumed or timed out), then reacts to every store notification by
//! scanning the queue and submitting unclaimed PENDING jobs. All outcomes are
//! written back through the store, never returned as errors. After `shutdown`
//! nothing new starts and outcomes of calls still in flight are dropped.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;

use crate::config::WidgetConfig;
use crate::models::generation::GenerationRequest;
use crate::models::job::{ImageBlob, Job, JobId, JobState, JobStatus, JobUpdate};
use crate::models::state::AppSnapshot;
use crate::services::codec;
use crate::services::generation::{GenerationClient, GenerationError};
use crate::services::store::{Store, Subscription};

pub const IMAGE_LOST_MESSAGE: &str = "Image data lost - please re-upload and try again";
pub const IMAGE_RESTORE_FAILED_MESSAGE: &str = "Failed to restore image data - please re-upload";
pub const TIMEOUT_MESSAGE: &str = "Generation timed out - please retry";

// TimeDelta::seconds panics above i64::MAX / 1000.
const MAX_STALE_SECS: u64 = (i64::MAX / 1000) as u64;

/// Tunables for a [`QueueProcessor`].
#[derive(Debug, Clone, Copy)]
pub struct ProcessorSettings {
    /// How long a PROCESSING job inherited from an earlier load may be resumed.
    pub stale_after: TimeDelta,
    /// Cap on concurrent generation calls; `None` starts every eligible job.
    pub max_in_flight: Option<usize>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            stale_after: TimeDelta::minutes(5),
            max_in_flight: None,
        }
    }
}

impl From<&WidgetConfig> for ProcessorSettings {
    fn from(config: &WidgetConfig) -> Self {
        Self {
            stale_after: TimeDelta::seconds(config.stale_after_secs.min(MAX_STALE_SECS) as i64),
            max_in_flight: config.max_in_flight,
        }
    }
}

/// Register metric descriptions. Call once at startup.
pub fn describe_metrics() {
    metrics::describe_counter!("visualize_jobs_total", "Generation jobs submitted to the backend");
    metrics::describe_counter!("visualize_jobs_completed", "Generation jobs completed");
    metrics::describe_counter!("visualize_jobs_failed", "Generation jobs that ended in error");
    metrics::describe_histogram!(
        "visualize_generation_seconds",
        "Wall time of one generation call"
    );
    metrics::describe_gauge!("visualize_jobs_in_flight", "Generation calls currently awaiting a response");
}

pub struct QueueProcessor<C> {
    store: Arc<Store>,
    client: Arc<C>,
    settings: ProcessorSettings,
    runtime: Handle,
    in_flight: Mutex<HashSet<JobId>>,
    subscription: Mutex<Option<Subscription>>,
    shut_down: AtomicBool,
}

impl<C: GenerationClient> QueueProcessor<C> {
    /// Must be called from within a Tokio runtime; remote calls are spawned on it.
    pub fn new(
        store: Arc<Store>,
        client: Arc<C>,
        settings: ProcessorSettings,
    ) -> Result<Arc<Self>, ProcessorError> {
        let runtime = Handle::try_current().map_err(|_| ProcessorError::NoRuntime)?;
        Ok(Arc::new(Self {
            store,
            client,
            settings,
            runtime,
            in_flight: Mutex::new(HashSet::new()),
            subscription: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Subscribe to the store and resume whatever an earlier load left behind.
    pub fn init(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscription = self.store.subscribe(move |state| {
            if let Some(processor) = weak.upgrade() {
                processor.scan(state);
            }
        });
        *self.subscription.lock() = Some(subscription);

        let state = self.store.state();
        let summary = state.summary();
        tracing::info!(
            queue_length = state.queue.len(),
            pending = summary.pending,
            processing = summary.processing,
            "Queue processor initialized, checking for interrupted work"
        );

        let now = Utc::now();
        for job in state.queue.iter().filter(|job| job.status() == JobStatus::Processing) {
            if !self.is_in_flight(&job.id) {
                self.reconcile_interrupted(&job.id, now);
            }
        }
        self.scan(&self.store.state());
    }

    /// Stop reacting to store changes. Calls already in flight run to
    /// completion but their outcomes are dropped; their claims are released
    /// as they finish.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.subscription.lock().take();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Number of jobs currently claimed by this processor.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, id: &JobId) -> bool {
        self.in_flight.lock().contains(id)
    }

    /// Submit every unclaimed PENDING job in `state`. Safe to call
    /// repeatedly; claimed jobs are skipped.
    pub fn scan(self: &Arc<Self>, state: &AppSnapshot) {
        if self.is_shut_down() {
            return;
        }
        for job in &state.queue {
            if job.state == JobState::Pending && !self.is_in_flight(&job.id) {
                self.start(&job.id);
            }
        }
    }

    /// A PROCESSING job nobody here claimed was cut off by a reload: its
    /// request, if still alive, belongs to a context that is gone.
    fn reconcile_interrupted(self: &Arc<Self>, id: &JobId, now: DateTime<Utc>) {
        if !self.claim(id, false) {
            return;
        }

        let requeued = match self.store.job(id).map(|job| job.state) {
            Some(JobState::Processing { started_at }) => {
                let elapsed = now.signed_duration_since(started_at);
                if elapsed > self.settings.stale_after {
                    tracing::warn!(
                        job_id = %id,
                        elapsed_secs = elapsed.num_seconds(),
                        "Interrupted job exceeded processing timeout"
                    );
                    metrics::counter!("visualize_jobs_failed").increment(1);
                    self.store.update_job(
                        id,
                        JobUpdate::Fail {
                            at: now,
                            message: TIMEOUT_MESSAGE.to_string(),
                        },
                    );
                    false
                } else {
                    tracing::info!(job_id = %id, "Resetting interrupted job to PENDING");
                    self.store.update_job(id, JobUpdate::Requeue)
                }
            }
            _ => false,
        };

        self.release(id);
        if requeued {
            self.start(id);
        }
    }

    fn start(self: &Arc<Self>, id: &JobId) {
        if self.is_shut_down() || !self.claim(id, true) {
            return;
        }

        // The scanned snapshot may be stale; decide on the live job.
        let Some(job) = self.store.job(id).filter(|job| job.state == JobState::Pending) else {
            self.release(id);
            return;
        };

        let Some(image) = self.resolve_image(&job) else {
            self.release(id);
            return;
        };

        let started_at = Utc::now();
        if !self.store.update_job(id, JobUpdate::Start { at: started_at }) {
            self.release(id);
            return;
        }

        let state = self.store.state();
        let request = GenerationRequest {
            generate_url: state.config.generate_url(),
            job_id: job.id.clone(),
            image,
            product_url: job.product_url.clone(),
            model: job.selected_model,
            domain: state.config.domain.clone(),
            session_id: state.session_id.clone(),
        };

        tracing::info!(
            job_id = %job.id,
            short_id = job.id.short(),
            model = %job.selected_model,
            "Starting generation"
        );
        metrics::counter!("visualize_jobs_total").increment(1);

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            this.run(request).await;
        });
    }

    /// Find a usable image for a job, restoring it from its encoded form when
    /// the in-memory handle did not survive. Fails the job when neither works.
    fn resolve_image(&self, job: &Job) -> Option<ImageBlob> {
        if let Some(image) = &job.user_image {
            return Some(image.clone());
        }

        let message = match job.user_image_encoded.as_deref().map(codec::decode) {
            Some(Some(image)) => {
                tracing::info!(job_id = %job.id, "Restored image from encoded form");
                self.store
                    .update_job(&job.id, JobUpdate::RestoreImage(image.clone()));
                return Some(image);
            }
            Some(None) => IMAGE_RESTORE_FAILED_MESSAGE,
            None => IMAGE_LOST_MESSAGE,
        };

        tracing::warn!(job_id = %job.id, reason = message, "Job has no usable image");
        metrics::counter!("visualize_jobs_failed").increment(1);
        self.store.update_job(
            &job.id,
            JobUpdate::Fail {
                at: Utc::now(),
                message: message.to_string(),
            },
        );
        None
    }

    async fn run(self: Arc<Self>, request: GenerationRequest) {
        let id = request.job_id.clone();
        let model = request.model;
        let started = Instant::now();

        let outcome = self
            .client
            .generate(request)
            .await
            .and_then(|response| {
                response
                    .into_result(model, Utc::now())
                    .ok_or(GenerationError::EmptyResult)
            });
        metrics::histogram!("visualize_generation_seconds").record(started.elapsed().as_secs_f64());

        if self.is_shut_down() {
            tracing::debug!(job_id = %id, "Processor shut down, outcome dropped");
            self.release(&id);
            return;
        }

        let update = match outcome {
            Ok(result) => {
                tracing::info!(
                    job_id = %id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    generated_image_url = %result.generated_image_url,
                    "Generation complete"
                );
                metrics::counter!("visualize_jobs_completed").increment(1);
                JobUpdate::Complete {
                    at: Utc::now(),
                    result,
                }
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Generation failed");
                metrics::counter!("visualize_jobs_failed").increment(1);
                JobUpdate::Fail {
                    at: Utc::now(),
                    message: e.to_string(),
                }
            }
        };

        if !self.store.update_job(&id, update) {
            tracing::debug!(job_id = %id, "Job no longer queued, result dropped");
        }
        self.release(&id);

        // Scans skipped this job while it was claimed, and a freed slot may
        // let a held-back job start.
        let state = self.store.state();
        self.scan(&state);
    }

    /// Mark `id` as owned by this processor. `bounded` claims count against
    /// `max_in_flight`.
    fn claim(&self, id: &JobId, bounded: bool) -> bool {
        let mut in_flight = self.in_flight.lock();
        if let Some(limit) = self.settings.max_in_flight.filter(|_| bounded) {
            if in_flight.len() >= limit {
                return false;
            }
        }
        let claimed = in_flight.insert(id.clone());
        metrics::gauge!("visualize_jobs_in_flight").set(in_flight.len() as f64);
        claimed
    }

    fn release(&self, id: &JobId) {
        let mut in_flight = self.in_flight.lock();
        in_flight.remove(id);
        metrics::gauge!("visualize_jobs_in_flight").set(in_flight.len() as f64);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Queue processor must be created inside a Tokio runtime")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use crate::models::state::{ModelTier, StatePatch};
    use crate::services::generation::HttpGenerationClient;
    use crate::services::session_store::MemorySessionStorage;
    use std::time::Duration;

    fn store() -> Arc<Store> {
        Store::new(
            Arc::new(MemorySessionStorage::new()),
            WidgetConfig::new("shop.example").unwrap(),
        )
    }

    #[test]
    fn test_settings_from_config() {
        let config = WidgetConfig::new("shop.example")
            .unwrap()
            .merged(ConfigOverrides {
                stale_after_secs: Some(90),
                max_in_flight: Some(3),
                ..ConfigOverrides::default()
            })
            .unwrap();
        let settings = ProcessorSettings::from(&config);
        assert_eq!(settings.stale_after, TimeDelta::seconds(90));
        assert_eq!(settings.max_in_flight, Some(3));

        let defaults = ProcessorSettings::default();
        assert_eq!(defaults.stale_after, TimeDelta::minutes(5));
        assert!(defaults.max_in_flight.is_none());
    }

    #[test]
    fn test_requires_runtime() {
        let client = HttpGenerationClient::new(Duration::from_secs(1)).unwrap();
        let result = QueueProcessor::new(store(), Arc::new(client), ProcessorSettings::default());
        assert!(matches!(result, Err(ProcessorError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_reacting() {
        let client = HttpGenerationClient::new(Duration::from_secs(1)).unwrap();
        let store = store();
        let processor =
            QueueProcessor::new(Arc::clone(&store), Arc::new(client), ProcessorSettings::default())
                .unwrap();
        processor.init();
        processor.shutdown();

        let job = Job::new(
            JobId::from("idle"),
            "https://shop.example/chair",
            None,
            ImageBlob::new("image/png", vec![1u8, 2, 3]),
            ModelTier::Fast,
        );
        let mut queue = store.state().queue.clone();
        queue.push(job);
        store.set_state(StatePatch::queue(queue));

        assert_eq!(processor.in_flight(), 0);
        assert_eq!(
            store.job(&JobId::from("idle")).map(|job| job.status()),
            Some(JobStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_scan_leaves_processing_jobs_alone() {
        let client = HttpGenerationClient::new(Duration::from_secs(1)).unwrap();
        let store = store();
        let processor =
            QueueProcessor::new(Arc::clone(&store), Arc::new(client), ProcessorSettings::default())
                .unwrap();

        let mut job = Job::new(
            JobId::from("running"),
            "https://shop.example/lamp",
            None,
            ImageBlob::new("image/png", vec![1u8, 2, 3]),
            ModelTier::Fast,
        );
        job.apply(JobUpdate::Start { at: Utc::now() }).unwrap();
        store.set_state(StatePatch::queue(vec![job]));

        processor.scan(&store.state());
        processor.scan(&store.state());

        assert_eq!(processor.in_flight(), 0);
        assert_eq!(
            store.job(&JobId::from("running")).map(|job| job.status()),
            Some(JobStatus::Processing)
        );
    }
}
