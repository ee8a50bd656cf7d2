//! Entry points the UI dispatches into the store.

use garde::Validate;

use crate::config::{ConfigError, ConfigOverrides};
use crate::models::generation::GeneratedImage;
use crate::models::job::{ImageBlob, Job, JobId, JobStatus, JobUpdate, NewJob};
use crate::models::state::{ModelTier, QueueTab, StatePatch, View};
use crate::services::store::Store;

/// Open the modal, merging host-page overrides into the configuration.
pub fn open_modal(store: &Store, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    let config = store.state().config.merged(overrides)?;
    store.set_state(StatePatch {
        is_open: Some(true),
        config: Some(config),
        ..StatePatch::default()
    });
    Ok(())
}

pub fn close_modal(store: &Store) {
    store.set_state(StatePatch {
        is_open: Some(false),
        ..StatePatch::default()
    });
}

pub fn set_uploaded_image(store: &Store, image: Option<ImageBlob>) {
    store.set_state(StatePatch {
        uploaded_image: Some(image),
        view: Some(View::Upload),
        ..StatePatch::default()
    });
}

pub fn start_generation(store: &Store) {
    store.set_state(StatePatch {
        view: Some(View::Generating),
        error: Some(None),
        ..StatePatch::default()
    });
}

pub fn set_generation_results(store: &Store, images: Vec<GeneratedImage>) {
    store.set_state(StatePatch {
        generated_images: Some(images),
        view: Some(View::Results),
        ..StatePatch::default()
    });
}

pub fn set_error(store: &Store, message: impl Into<String>) {
    store.set_state(StatePatch {
        error: Some(Some(message.into())),
        view: Some(View::Error),
        ..StatePatch::default()
    });
}

/// Back to a clean upload screen. The queue is left alone.
pub fn reset(store: &Store) {
    store.set_state(StatePatch {
        view: Some(View::Upload),
        uploaded_image: Some(None),
        generated_images: Some(Vec::new()),
        error: Some(None),
        ..StatePatch::default()
    });
}

pub fn set_view(store: &Store, view: View) {
    store.set_state(StatePatch::view(view));
}

pub fn set_selected_model(store: &Store, model: ModelTier) {
    store.set_state(StatePatch {
        selected_model: Some(model),
        ..StatePatch::default()
    });
}

pub fn set_queue_tab(store: &Store, tab: QueueTab) {
    store.set_state(StatePatch {
        queue_tab: Some(tab),
        ..StatePatch::default()
    });
}

/// Append a PENDING job and persist its image in encoded form.
///
/// Returns once the encoded copy has been written to session storage, so a
/// reload after this point can always resume the job.
pub async fn add_to_queue(store: &Store, new_job: NewJob) -> Result<JobId, JobError> {
    new_job.validate()?;
    let id = new_job.id.clone().unwrap_or_else(JobId::generate);

    let mut duplicate = false;
    store.update(|state| {
        if state.job(&id).is_some() {
            duplicate = true;
            return None;
        }
        let model = new_job.model.unwrap_or(state.selected_model);
        let job = Job::new(
            id.clone(),
            new_job.product_url,
            new_job.product_name,
            new_job.image,
            model,
        );
        let mut queue = state.queue.clone();
        queue.push(job);
        Some(StatePatch::queue(queue))
    });
    if duplicate {
        return Err(JobError::DuplicateId(id));
    }

    tracing::info!(job_id = %id, "Job added to queue");
    store.encode_pending_images().await;
    Ok(id)
}

/// Queue the image sitting in the upload view, then switch to the queue view.
pub async fn queue_uploaded_image(
    store: &Store,
    product_url: impl Into<String>,
    product_name: Option<String>,
) -> Result<JobId, JobError> {
    let image = store
        .state()
        .uploaded_image
        .clone()
        .ok_or(JobError::NoUploadedImage)?;

    let id = add_to_queue(
        store,
        NewJob {
            product_name,
            ..NewJob::new(product_url, image)
        },
    )
    .await?;

    store.set_state(StatePatch {
        uploaded_image: Some(None),
        view: Some(View::Queue),
        ..StatePatch::default()
    });
    Ok(id)
}

pub fn update_queue_item(store: &Store, id: &JobId, update: JobUpdate) -> bool {
    store.update_job(id, update)
}

/// Drop a job. An in-flight call for it keeps running; its result is ignored.
pub fn remove_from_queue(store: &Store, id: &JobId) -> bool {
    let mut removed = false;
    store.update(|state| {
        let queue: Vec<Job> = state.queue.iter().filter(|job| &job.id != id).cloned().collect();
        removed = queue.len() != state.queue.len();
        removed.then(|| StatePatch::queue(queue))
    });
    if removed {
        tracing::info!(job_id = %id, "Job removed from queue");
    }
    removed
}

/// Put a failed job back to PENDING so the processor picks it up again.
pub fn retry_job(store: &Store, id: &JobId) -> bool {
    let retried = store.update_job(id, JobUpdate::Retry);
    if retried {
        tracing::info!(job_id = %id, "Job queued for retry");
    }
    retried
}

/// Remove every completed job. Returns how many were removed.
pub fn clear_completed(store: &Store) -> usize {
    let mut cleared = 0;
    store.update(|state| {
        let queue: Vec<Job> = state
            .queue
            .iter()
            .filter(|job| job.status() != JobStatus::Completed)
            .cloned()
            .collect();
        cleared = state.queue.len() - queue.len();
        (cleared > 0).then(|| StatePatch::queue(queue))
    });
    cleared
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job request: {0}")]
    Invalid(#[from] garde::Report),

    #[error("A job with id {0} is already queued")]
    DuplicateId(JobId),

    #[error("No uploaded image to queue")]
    NoUploadedImage,
}
