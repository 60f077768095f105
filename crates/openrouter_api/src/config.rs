use std::collections::BTreeMap;
use std::time::Duration;

use crate::url::DEFAULT_OPENROUTER_BASE_URL;

/// Transport configuration for OpenRouter requests.
#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    /// API key passed as a bearer token.
    pub api_key: String,
    /// Base URL; normalized to the chat-completions endpoint.
    pub base_url: String,
    /// Optional `HTTP-Referer` attribution header.
    pub referer: Option<String>,
    /// Optional `X-Title` attribution header.
    pub app_title: Option<String>,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    /// Optional request timeout.
    pub timeout: Option<Duration>,
    /// Sampling temperature applied when a request leaves it unset.
    pub default_temperature: Option<f64>,
    /// Largest unterminated SSE frame accepted before the stream fails.
    pub max_buffer_size: Option<usize>,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_OPENROUTER_BASE_URL.to_string(),
            referer: None,
            app_title: Some("mol-agent".to_string()),
            user_agent: None,
            extra_headers: BTreeMap::new(),
            timeout: None,
            default_temperature: Some(0.2),
            max_buffer_size: None,
        }
    }
}

impl OpenRouterConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_app_title(mut self, app_title: impl Into<String>) -> Self {
        self.app_title = Some(app_title.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_default_temperature(mut self, temperature: Option<f64>) -> Self {
        self.default_temperature = temperature;
        self
    }

    pub fn with_max_buffer_size(mut self, limit: Option<usize>) -> Self {
        self.max_buffer_size = limit;
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}
