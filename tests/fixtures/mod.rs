//! Tiny image payloads and persisted-state builders.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use room_visualizer::models::job::ImageBlob;
use serde_json::{json, Value};

/// 1x1 transparent PNG.
pub const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// JPEG header; enough for format sniffing.
pub const JPEG_HEADER: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

pub fn png_image() -> ImageBlob {
    ImageBlob::from_upload(PNG_1X1.to_vec()).expect("fixture is a PNG")
}

pub fn jpeg_image() -> ImageBlob {
    ImageBlob::from_upload(JPEG_HEADER.to_vec()).expect("fixture is a JPEG")
}

pub fn product_url(slug: &str) -> String {
    format!("https://shop.test/products/{slug}")
}

/// A persisted job as an earlier page load would have left it.
pub struct PersistedJob {
    pub id: &'static str,
    pub product: &'static str,
    pub status: &'static str,
    pub started_at: Option<DateTime<Utc>>,
    pub encoded_image: Option<String>,
}

impl PersistedJob {
    pub fn to_json(&self) -> Value {
        let mut job = json!({
            "id": self.id,
            "productUrl": product_url(self.product),
            "selectedModel": "fast",
            "queuedAt": Utc::now(),
            "status": self.status,
        });
        if let Some(started_at) = self.started_at {
            job["startedAt"] = json!(started_at);
        }
        if let Some(encoded) = &self.encoded_image {
            job["userImageEncoded"] = json!(encoded);
        }
        job
    }
}

/// Body stored under the main state key.
pub fn persisted_state(jobs: &[PersistedJob]) -> String {
    json!({
        "queue": jobs.iter().map(PersistedJob::to_json).collect::<Vec<_>>(),
        "generatedImages": [],
        "selectedModel": "fast",
        "queueTab": "all",
    })
    .to_string()
}
