use std::collections::BTreeMap;

use crate::config::OpenRouterConfig;
use crate::error::OpenRouterError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_REFERER: &str = "HTTP-Referer";
pub const HEADER_TITLE: &str = "X-Title";
pub const HEADER_USER_AGENT: &str = "User-Agent";

/// Build a deterministic header map for OpenRouter requests.
pub fn build_headers(config: &OpenRouterConfig) -> Result<BTreeMap<String, String>, OpenRouterError> {
    let api_key = config.api_key.trim();
    if api_key.is_empty() {
        return Err(OpenRouterError::MissingApiKey);
    }

    let mut headers = BTreeMap::new();
    headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {api_key}"));
    headers.insert(HEADER_ACCEPT.to_owned(), "text/event-stream".to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );

    if let Some(referer) = non_empty(config.referer.as_deref()) {
        headers.insert(HEADER_REFERER.to_owned(), referer.to_owned());
    }
    if let Some(title) = non_empty(config.app_title.as_deref()) {
        headers.insert(HEADER_TITLE.to_owned(), title.to_owned());
    }

    let user_agent = non_empty(config.user_agent.as_deref())
        .map(ToString::to_string)
        .unwrap_or_else(default_user_agent);
    headers.insert(HEADER_USER_AGENT.to_owned(), user_agent);

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    Ok(headers)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn default_user_agent() -> String {
    format!(
        "mol-agent/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
