//! Text-safe encoding of image payloads for session persistence.
//!
//! Images are stored as `data:<mime>;base64,<payload>` URLs, the same shape a
//! browser `FileReader.readAsDataURL` produces.

use base64::Engine;

use crate::models::job::ImageBlob;

const DATA_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64,";

/// Encode an image as a data URL.
pub fn encode(image: &ImageBlob) -> String {
    let payload = base64::engine::general_purpose::STANDARD.encode(image.bytes());
    format!("{DATA_PREFIX}{}{BASE64_MARKER}{payload}", image.mime_type())
}

/// Decode a data URL back into an image. Returns `None` for malformed input.
pub fn decode(text: &str) -> Option<ImageBlob> {
    let rest = text.strip_prefix(DATA_PREFIX)?;
    let (mime_type, payload) = rest.split_once(BASE64_MARKER)?;
    if mime_type.is_empty() || mime_type.contains(',') {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    Some(ImageBlob::new(mime_type, bytes))
}

/// Encode on the blocking pool; large photos take a while to base64.
pub async fn encode_async(image: ImageBlob) -> Result<String, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || encode(&image)).await
}
