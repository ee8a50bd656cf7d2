use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::state::ModelTier;

/// Opaque job identifier, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Wire/persisted status of a job. The casing is part of the storage contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// In-memory image payload as produced by the upload control.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBlob {
    mime_type: String,
    bytes: Arc<[u8]>,
}

impl ImageBlob {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Build a blob from raw upload bytes, sniffing the format from magic bytes.
    ///
    /// Only the formats the upload control accepts (PNG, JPEG, WebP) are allowed.
    pub fn from_upload(bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        let format = image::guess_format(&bytes).map_err(|_| ImageError::UnknownFormat)?;
        match format {
            image::ImageFormat::Png | image::ImageFormat::Jpeg | image::ImageFormat::WebP => {
                Ok(Self::new(format.to_mime_type(), bytes))
            }
            other => Err(ImageError::Unsupported(other.to_mime_type().to_string())),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension sent alongside the multipart upload.
    pub fn file_extension(&self) -> &'static str {
        image::ImageFormat::from_mime_type(&self.mime_type)
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("bin")
    }
}

impl fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBlob")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Image upload is empty")]
    Empty,

    #[error("Image format not recognized")]
    UnknownFormat,

    #[error("Unsupported image format: {0}")]
    Unsupported(String),
}

/// Output of a successful generation, stored on a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub generated_image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_image_url: Option<String>,
    pub model: ModelTier,
    /// Backend-reported generation time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_data: Option<serde_json::Value>,
}

/// Status-gated part of a job. Serialized flat next to the job fields,
/// tagged by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Processing {
        #[serde(rename = "startedAt")]
        started_at: DateTime<Utc>,
    },
    Completed {
        #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        #[serde(rename = "completedAt")]
        completed_at: DateTime<Utc>,
        result: GenerationResult,
    },
    Error {
        #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        #[serde(rename = "completedAt")]
        completed_at: DateTime<Utc>,
        error: String,
    },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Error { .. } => JobStatus::Error,
        }
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Pending => None,
            JobState::Processing { started_at } => Some(*started_at),
            JobState::Completed { started_at, .. } | JobState::Error { started_at, .. } => {
                *started_at
            }
        }
    }
}

/// A typed mutation of a single job, applied through the store.
#[derive(Debug, Clone)]
pub enum JobUpdate {
    /// Reattach an image handle rebuilt from its encoded form.
    RestoreImage(ImageBlob),
    /// Record the text-encoded copy of the image.
    ImageEncoded(String),
    /// PENDING → PROCESSING.
    Start { at: DateTime<Utc> },
    /// PROCESSING → COMPLETED.
    Complete {
        at: DateTime<Utc>,
        result: GenerationResult,
    },
    /// PENDING or PROCESSING → ERROR.
    Fail { at: DateTime<Utc>, message: String },
    /// PROCESSING → PENDING, for work interrupted by a reload.
    Requeue,
    /// ERROR → PENDING, user initiated.
    Retry,
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One visualize-my-room request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub product_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip)]
    pub user_image: Option<ImageBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image_encoded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image_url: Option<String>,
    pub selected_model: ModelTier,
    pub queued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: JobState,
}

impl Job {
    pub fn new(
        id: JobId,
        product_url: impl Into<String>,
        product_name: Option<String>,
        image: ImageBlob,
        selected_model: ModelTier,
    ) -> Self {
        Self {
            id,
            product_url: product_url.into(),
            product_name,
            user_image: Some(image),
            user_image_encoded: None,
            user_image_url: None,
            selected_model,
            queued_at: Utc::now(),
            state: JobState::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn result(&self) -> Option<&GenerationResult> {
        match &self.state {
            JobState::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.started_at()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Completed { completed_at, .. } | JobState::Error { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    /// Whether the job still has some form of its image.
    pub fn has_image_data(&self) -> bool {
        self.user_image.is_some() || self.user_image_encoded.is_some()
    }

    /// Apply an update, enforcing the status state machine.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), TransitionError> {
        let from = self.status();
        let reject = |to| Err(TransitionError { from, to });

        match update {
            JobUpdate::RestoreImage(image) => {
                self.user_image = Some(image);
            }
            JobUpdate::ImageEncoded(encoded) => {
                self.user_image_encoded = Some(encoded);
            }
            JobUpdate::Start { at } => {
                if from != JobStatus::Pending {
                    return reject(JobStatus::Processing);
                }
                self.state = JobState::Processing { started_at: at };
            }
            JobUpdate::Complete { at, result } => {
                let JobState::Processing { started_at } = &self.state else {
                    return reject(JobStatus::Completed);
                };
                let started_at = *started_at;
                if let Some(original) = &result.original_image_url {
                    self.user_image_url = Some(original.clone());
                }
                self.state = JobState::Completed {
                    started_at: Some(started_at),
                    completed_at: at,
                    result,
                };
            }
            JobUpdate::Fail { at, message } => {
                if !matches!(from, JobStatus::Pending | JobStatus::Processing) {
                    return reject(JobStatus::Error);
                }
                self.state = JobState::Error {
                    started_at: self.state.started_at(),
                    completed_at: at,
                    error: message,
                };
            }
            JobUpdate::Requeue => {
                if from != JobStatus::Processing {
                    return reject(JobStatus::Pending);
                }
                self.state = JobState::Pending;
            }
            JobUpdate::Retry => {
                if from != JobStatus::Error {
                    return reject(JobStatus::Pending);
                }
                self.state = JobState::Pending;
            }
        }
        Ok(())
    }
}

/// Request to queue a new job, as dispatched by the upload view.
#[derive(Debug, Clone, Validate)]
pub struct NewJob {
    /// Caller-supplied id; generated when absent.
    #[garde(skip)]
    pub id: Option<JobId>,

    #[garde(url, length(max = 2048))]
    pub product_url: String,

    #[garde(length(min = 1, max = 300))]
    pub product_name: Option<String>,

    #[garde(skip)]
    pub image: ImageBlob,

    /// Falls back to the currently selected model.
    #[garde(skip)]
    pub model: Option<ModelTier>,
}

impl NewJob {
    pub fn new(product_url: impl Into<String>, image: ImageBlob) -> Self {
        Self {
            id: None,
            product_url: product_url.into(),
            product_name: None,
            image,
            model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn sample_job() -> Job {
        Job::new(
            JobId::from("job-1"),
            "https://shop.example/sofa",
            Some("Sofa".to_string()),
            ImageBlob::new("image/png", PNG_MAGIC),
            ModelTier::Fast,
        )
    }

    fn sample_result() -> GenerationResult {
        GenerationResult {
            generated_image_url: "https://cdn.example/out.png".to_string(),
            original_image_url: Some("https://cdn.example/in.png".to_string()),
            model: ModelTier::Fast,
            generation_time: Some(12.5),
            timestamp: Utc::now(),
            product_data: None,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = sample_job();
        assert_eq!(job.status(), JobStatus::Pending);

        job.apply(JobUpdate::Start { at: Utc::now() }).unwrap();
        assert_eq!(job.status(), JobStatus::Processing);
        assert!(job.started_at().is_some());

        job.apply(JobUpdate::Complete {
            at: Utc::now(),
            result: sample_result(),
        })
        .unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.result().is_some());
        assert!(job.error().is_none());
        assert_eq!(job.user_image_url.as_deref(), Some("https://cdn.example/in.png"));
    }

    #[test]
    fn test_rejects_invalid_transitions() {
        let mut job = sample_job();
        let err = job
            .apply(JobUpdate::Complete {
                at: Utc::now(),
                result: sample_result(),
            })
            .unwrap_err();
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(err.to, JobStatus::Completed);

        assert!(job.apply(JobUpdate::Retry).is_err());
        assert!(job.apply(JobUpdate::Requeue).is_err());

        job.apply(JobUpdate::Start { at: Utc::now() }).unwrap();
        assert!(job.apply(JobUpdate::Start { at: Utc::now() }).is_err());

        job.apply(JobUpdate::Complete {
            at: Utc::now(),
            result: sample_result(),
        })
        .unwrap();
        // Completed is final.
        assert!(job.apply(JobUpdate::Retry).is_err());
        assert!(job
            .apply(JobUpdate::Fail {
                at: Utc::now(),
                message: "late".into()
            })
            .is_err());
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_requeue_clears_started_at() {
        let mut job = sample_job();
        job.apply(JobUpdate::Start { at: Utc::now() }).unwrap();
        job.apply(JobUpdate::Requeue).unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.started_at().is_none());
    }

    #[test]
    fn test_retry_after_error() {
        let mut job = sample_job();
        job.apply(JobUpdate::Fail {
            at: Utc::now(),
            message: "Image data lost".into(),
        })
        .unwrap();
        assert_eq!(job.error(), Some("Image data lost"));

        job.apply(JobUpdate::Retry).unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.error().is_none());
        assert!(job.completed_at().is_none());
    }

    #[test]
    fn test_serialized_layout() {
        let mut job = sample_job();
        job.user_image_encoded = Some("data:image/png;base64,AAAA".into());
        job.apply(JobUpdate::Start { at: Utc::now() }).unwrap();

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "PROCESSING");
        assert_eq!(value["productUrl"], "https://shop.example/sofa");
        assert_eq!(value["selectedModel"], "fast");
        assert!(value.get("startedAt").is_some());
        assert!(value.get("userImage").is_none());
        assert!(value.get("result").is_none());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.status(), JobStatus::Processing);
        assert!(back.user_image.is_none());
        assert_eq!(back.user_image_encoded, job.user_image_encoded);
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(JobStatus::Pending.to_string(), "PENDING");
        assert_eq!("ERROR".parse::<JobStatus>().unwrap(), JobStatus::Error);
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }

    #[test]
    fn test_image_from_upload_sniffs_format() {
        let png = ImageBlob::from_upload(PNG_MAGIC.to_vec()).unwrap();
        assert_eq!(png.mime_type(), "image/png");
        assert_eq!(png.file_extension(), "png");

        let jpeg = ImageBlob::from_upload(vec![0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10]).unwrap();
        assert_eq!(jpeg.mime_type(), "image/jpeg");

        assert!(matches!(
            ImageBlob::from_upload(b"plain text".to_vec()),
            Err(ImageError::UnknownFormat)
        ));
        assert!(matches!(ImageBlob::from_upload(Vec::new()), Err(ImageError::Empty)));
    }
}
