use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{GenerationResult, ImageBlob, JobId};
use crate::models::state::ModelTier;

/// Everything the backend needs to render one room preview.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Resolved from the configuration current when the job starts.
    pub generate_url: String,
    pub job_id: JobId,
    pub image: ImageBlob,
    pub product_url: String,
    pub model: ModelTier,
    pub domain: String,
    pub session_id: Option<String>,
}

/// A rendered image as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Timing>,
}

/// Success body of `POST {api}/generate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    #[serde(default)]
    pub generated_images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_data: Option<serde_json::Value>,
}

impl GenerationResponse {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.timings
            .as_ref()
            .and_then(|t| t.total.as_ref())
            .and_then(|t| t.duration_seconds)
    }

    /// Convert into the result stored on the job. `None` when the backend
    /// answered 2xx without any image.
    pub fn into_result(self, model: ModelTier, at: DateTime<Utc>) -> Option<GenerationResult> {
        let generation_time = self.duration_seconds();
        let first = self.generated_images.into_iter().next()?;
        Some(GenerationResult {
            generated_image_url: first.url,
            original_image_url: first.original_image_url,
            model,
            generation_time,
            timestamp: at,
            product_data: self.product_data,
        })
    }
}

/// Failure body of `POST {api}/generate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}
