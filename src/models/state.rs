use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::WidgetConfig;
use crate::models::generation::GeneratedImage;
use crate::models::job::{ImageBlob, Job, JobId, JobStatus};

/// Screen currently shown in the widget modal.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum View {
    #[default]
    Upload,
    Generating,
    Results,
    Error,
    Queue,
}

/// Quality/speed tier requested from the backend.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ModelTier {
    #[default]
    Fast,
    Quality,
}

/// Filter applied by the queue view.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum QueueTab {
    #[default]
    All,
    Active,
    Completed,
    Failed,
}

impl QueueTab {
    pub fn matches(self, job: &Job) -> bool {
        match self {
            QueueTab::All => true,
            QueueTab::Active => !job.status().is_terminal(),
            QueueTab::Completed => job.status() == JobStatus::Completed,
            QueueTab::Failed => job.status() == JobStatus::Error,
        }
    }
}

/// Count of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueSummary {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Full application state held by the store.
#[derive(Debug, Clone)]
pub struct AppSnapshot {
    pub is_open: bool,
    pub view: View,
    pub uploaded_image: Option<ImageBlob>,
    pub generated_images: Vec<GeneratedImage>,
    pub queue: Vec<Job>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub config: WidgetConfig,
    pub selected_model: ModelTier,
    pub queue_tab: QueueTab,
}

impl AppSnapshot {
    pub fn initial(config: WidgetConfig) -> Self {
        Self {
            is_open: false,
            view: View::Upload,
            uploaded_image: None,
            generated_images: Vec::new(),
            queue: Vec::new(),
            error: None,
            session_id: None,
            config,
            selected_model: ModelTier::default(),
            queue_tab: QueueTab::default(),
        }
    }

    /// Shallow merge: every field set in the patch replaces the current one.
    pub fn merged(&self, patch: StatePatch) -> Self {
        let mut next = self.clone();
        if let Some(is_open) = patch.is_open {
            next.is_open = is_open;
        }
        if let Some(view) = patch.view {
            next.view = view;
        }
        if let Some(uploaded_image) = patch.uploaded_image {
            next.uploaded_image = uploaded_image;
        }
        if let Some(generated_images) = patch.generated_images {
            next.generated_images = generated_images;
        }
        if let Some(queue) = patch.queue {
            next.queue = queue;
        }
        if let Some(error) = patch.error {
            next.error = error;
        }
        if let Some(session_id) = patch.session_id {
            next.session_id = session_id;
        }
        if let Some(config) = patch.config {
            next.config = config;
        }
        if let Some(selected_model) = patch.selected_model {
            next.selected_model = selected_model;
        }
        if let Some(queue_tab) = patch.queue_tab {
            next.queue_tab = queue_tab;
        }
        next
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.queue.iter().find(|job| &job.id == id)
    }

    pub fn jobs_in_tab(&self, tab: QueueTab) -> impl Iterator<Item = &Job> {
        self.queue.iter().filter(move |job| tab.matches(job))
    }

    pub fn summary(&self) -> QueueSummary {
        self.queue
            .iter()
            .fold(QueueSummary::default(), |mut summary, job| {
                match job.status() {
                    JobStatus::Pending => summary.pending += 1,
                    JobStatus::Processing => summary.processing += 1,
                    JobStatus::Completed => summary.completed += 1,
                    JobStatus::Error => summary.failed += 1,
                }
                summary
            })
    }

    /// True when no job is waiting for or undergoing generation.
    pub fn is_settled(&self) -> bool {
        self.queue.iter().all(|job| job.status().is_terminal())
    }

    /// True when some job holds an image that has no encoded form yet.
    pub fn has_unencoded_images(&self) -> bool {
        self.queue
            .iter()
            .any(|job| job.user_image.is_some() && job.user_image_encoded.is_none())
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            queue: self.queue.clone(),
            generated_images: self.generated_images.clone(),
            selected_model: self.selected_model,
            queue_tab: self.queue_tab,
        }
    }

    pub fn modal_state(&self) -> ModalState {
        ModalState {
            is_open: self.is_open,
            view: self.view,
        }
    }
}

/// Partial update for [`AppSnapshot`]. `None` leaves a field untouched;
/// nullable fields use a nested `Option` so they can be cleared.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub is_open: Option<bool>,
    pub view: Option<View>,
    pub uploaded_image: Option<Option<ImageBlob>>,
    pub generated_images: Option<Vec<GeneratedImage>>,
    pub queue: Option<Vec<Job>>,
    pub error: Option<Option<String>>,
    pub session_id: Option<Option<String>>,
    pub config: Option<WidgetConfig>,
    pub selected_model: Option<ModelTier>,
    pub queue_tab: Option<QueueTab>,
}

impl StatePatch {
    pub fn queue(queue: Vec<Job>) -> Self {
        Self {
            queue: Some(queue),
            ..Self::default()
        }
    }

    pub fn view(view: View) -> Self {
        Self {
            view: Some(view),
            ..Self::default()
        }
    }

    pub fn touches_modal(&self) -> bool {
        self.is_open.is_some() || self.view.is_some()
    }
}

/// What survives a reload under the main state key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub queue: Vec<Job>,
    #[serde(default)]
    pub generated_images: Vec<GeneratedImage>,
    #[serde(default)]
    pub selected_model: ModelTier,
    #[serde(default)]
    pub queue_tab: QueueTab,
}

/// Modal visibility, persisted under its own key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalState {
    pub is_open: bool,
    pub view: View,
}
