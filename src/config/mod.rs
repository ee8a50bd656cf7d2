use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;

const PRODUCTION_API_ENDPOINT: &str = "https://ai-furniture-backend.vercel.app/api";
const LOCAL_API_ENDPOINT: &str = "http://localhost:4000/api";
const PRODUCTION_WIDGET_ENDPOINT: &str = "https://ai-furniture-backend.vercel.app/furniture";
const LOCAL_WIDGET_ENDPOINT: &str = "http://localhost:3000/furniture";

const ENV_PREFIX: &str = "ROOM_VISUALIZER_";

/// Merged widget configuration.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct WidgetConfig {
    /// Merchant domain the widget is embedded on. Sent with every generation.
    #[garde(length(min = 1, max = 253))]
    pub domain: String,

    /// Base URL of the generation backend (`{api_endpoint}/generate`).
    #[garde(url)]
    pub api_endpoint: String,

    /// Analytics pixel endpoint, kept for the host page.
    #[garde(url)]
    pub tracking_endpoint: String,

    /// Hosted widget page.
    #[garde(url)]
    pub widget_endpoint: String,

    #[garde(skip)]
    pub debug: bool,

    /// Directory backing the file session store used by the CLI host.
    #[garde(skip)]
    pub session_dir: PathBuf,

    /// Age after which an interrupted PROCESSING job is failed instead of resumed.
    #[garde(range(min = 1))]
    pub stale_after_secs: u64,

    #[garde(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Upper bound on concurrent generation calls. `None` means unbounded.
    #[garde(range(min = 1))]
    pub max_in_flight: Option<usize>,
}

/// Optional values merged over a [`WidgetConfig`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigOverrides {
    pub api_endpoint: Option<String>,
    pub tracking_endpoint: Option<String>,
    pub widget_endpoint: Option<String>,
    pub debug: Option<bool>,
    pub session_dir: Option<PathBuf>,
    pub stale_after_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_in_flight: Option<usize>,
}

/// Raw environment layout read by `envy`.
#[derive(Debug, Deserialize)]
struct EnvConfig {
    domain: Option<String>,
    api_endpoint: Option<String>,
    tracking_endpoint: Option<String>,
    widget_endpoint: Option<String>,
    debug: Option<bool>,
    session_dir: Option<PathBuf>,
    stale_after_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    max_in_flight: Option<usize>,
}

impl WidgetConfig {
    /// Build the default configuration for a domain. Local development hosts
    /// point at the local backend and enable debug logging.
    pub fn new(domain: impl Into<String>) -> Result<Self, ConfigError> {
        let domain = domain.into();
        if domain.trim().is_empty() {
            return Err(ConfigError::MissingDomain);
        }

        let local = is_local_host(&domain);
        let api_endpoint = if local {
            LOCAL_API_ENDPOINT
        } else {
            PRODUCTION_API_ENDPOINT
        };

        let config = Self {
            tracking_endpoint: tracking_endpoint_for(api_endpoint),
            api_endpoint: api_endpoint.to_string(),
            widget_endpoint: if local {
                LOCAL_WIDGET_ENDPOINT
            } else {
                PRODUCTION_WIDGET_ENDPOINT
            }
            .to_string(),
            domain,
            debug: local,
            session_dir: PathBuf::from(".room-visualizer-session"),
            stale_after_secs: 300,
            request_timeout_secs: 120,
            max_in_flight: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from `ROOM_VISUALIZER_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let env: EnvConfig = envy::prefixed(ENV_PREFIX).from_env()?;
        let domain = env.domain.ok_or(ConfigError::MissingDomain)?;

        Self::new(domain)?.merged(ConfigOverrides {
            api_endpoint: env.api_endpoint,
            tracking_endpoint: env.tracking_endpoint,
            widget_endpoint: env.widget_endpoint,
            debug: env.debug,
            session_dir: env.session_dir,
            stale_after_secs: env.stale_after_secs,
            request_timeout_secs: env.request_timeout_secs,
            max_in_flight: env.max_in_flight,
        })
    }

    /// Merge overrides over this configuration and re-validate the result.
    ///
    /// Overriding only the API endpoint moves the tracking pixel along with it.
    pub fn merged(&self, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(api_endpoint) = overrides.api_endpoint {
            let api_endpoint = api_endpoint.trim_end_matches('/').to_string();
            if overrides.tracking_endpoint.is_none() {
                next.tracking_endpoint = tracking_endpoint_for(&api_endpoint);
            }
            next.api_endpoint = api_endpoint;
        }
        if let Some(tracking_endpoint) = overrides.tracking_endpoint {
            next.tracking_endpoint = tracking_endpoint;
        }
        if let Some(widget_endpoint) = overrides.widget_endpoint {
            next.widget_endpoint = widget_endpoint;
        }
        if let Some(debug) = overrides.debug {
            next.debug = debug;
        }
        if let Some(session_dir) = overrides.session_dir {
            next.session_dir = session_dir;
        }
        if let Some(secs) = overrides.stale_after_secs {
            next.stale_after_secs = secs;
        }
        if let Some(secs) = overrides.request_timeout_secs {
            next.request_timeout_secs = secs;
        }
        if overrides.max_in_flight.is_some() {
            next.max_in_flight = overrides.max_in_flight;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn generate_url(&self) -> String {
        format!("{}/generate", self.api_endpoint.trim_end_matches('/'))
    }
}

fn tracking_endpoint_for(api_endpoint: &str) -> String {
    format!("{}/tracking/pixel", api_endpoint)
}

/// Hosts treated as local development.
pub fn is_local_host(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0")
        || host.starts_with("192.168.")
        || host.starts_with("10.0.")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("\"domain\" is required (set ROOM_VISUALIZER_DOMAIN)")]
    MissingDomain,

    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
