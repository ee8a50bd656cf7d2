use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;

use crate::config::WidgetConfig;
use crate::models::generation::{ErrorBody, GenerationRequest, GenerationResponse};

const GENERIC_FAILURE: &str = "Failed to generate images";

/// Submits one room image to the generation backend.
///
/// Implementations must be cheap to share across tasks; the queue processor
/// calls `generate` concurrently for different jobs.
pub trait GenerationClient: Send + Sync + 'static {
    fn generate(
        &self,
        request: GenerationRequest,
    ) -> impl Future<Output = Result<GenerationResponse, GenerationError>> + Send;
}

/// HTTP client posting to the `generate_url` carried by each request.
pub struct HttpGenerationClient {
    http: Client,
}

impl HttpGenerationClient {
    pub fn new(timeout: Duration) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("room-visualizer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http })
    }

    /// Client with the configured request timeout.
    pub fn from_config(config: &WidgetConfig) -> Result<Self, GenerationError> {
        Self::new(Duration::from_secs(config.request_timeout_secs))
    }
}

impl GenerationClient for HttpGenerationClient {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let image = Part::bytes(request.image.bytes().to_vec())
            .file_name(format!("room.{}", request.image.file_extension()))
            .mime_str(request.image.mime_type())?;

        let mut form = Form::new()
            .part("image", image)
            .text("productUrl", request.product_url)
            .text("model", request.model.to_string())
            .text("domain", request.domain);
        if let Some(session_id) = request.session_id {
            form = form.text("sessionId", session_id);
        }

        tracing::debug!(
            job_id = %request.job_id,
            url = %request.generate_url,
            model = %request.model,
            bytes = request.image.len(),
            "Submitting generation request"
        );

        let response = self
            .http
            .post(&request.generate_url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string());
            return Err(GenerationError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<GenerationResponse>().await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx answer; the message is shown to the shopper as is.
    #[error("{message}")]
    Remote { status: u16, message: String },

    #[error("No generated image returned")]
    EmptyResult,
}
