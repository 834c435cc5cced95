//! Shared HTTP plumbing for the hosted adapters.
//!
//! Status classification:
//!
//! | response                         | error                          |
//! |----------------------------------|--------------------------------|
//! | connect failure, timeout         | `ProviderUnavailable` (retry)  |
//! | body cut off while reading       | `ProviderUnavailable` (retry)  |
//! | 408, 409, 5xx                    | `ProviderUnavailable` (retry)  |
//! | 429                              | `RateLimited` (retry)          |
//! | 401, 403                         | `Auth` (fatal)                 |
//! | other 4xx                        | `Provider` (fatal)             |
//! | 2xx with an undecodable body     | `Parse` (fatal)                |

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use trail_core::{AgentError, Result};

const MAX_ERROR_BODY: usize = 500;

pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))
}

/// Send a request and decode the JSON reply, classifying every failure
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request.send().await.map_err(|e| transport_error(provider, &e))?;
    let status = response.status();
    let body = response.text().await.map_err(|e| body_error(provider, &e))?;

    if !status.is_success() {
        tracing::warn!(provider, status = %status, "backend returned error status");
        return Err(status_error(provider, status, &body));
    }

    serde_json::from_str(&body).map_err(|e| {
        tracing::error!(provider, error = %e, "undecodable response body");
        AgentError::Parse(format!("{provider}: {e}"))
    })
}

pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> AgentError {
    let detail: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("{provider} returned {status}: {detail}");

    match status.as_u16() {
        429 => AgentError::RateLimited(message),
        408 | 409 | 500..=599 => AgentError::ProviderUnavailable(message),
        401 | 403 => AgentError::Auth(message),
        _ => AgentError::Provider(message),
    }
}

pub(crate) fn transport_error(provider: &str, err: &reqwest::Error) -> AgentError {
    if err.is_builder() {
        return AgentError::Config(format!("{provider}: invalid request: {err}"));
    }
    AgentError::ProviderUnavailable(format!("{provider}: {err}"))
}

/// The status line arrived but the body did not; the exchange can be repeated
pub(crate) fn body_error(provider: &str, err: &reqwest::Error) -> AgentError {
    tracing::warn!(provider, error = %err, "response body read failed");
    AgentError::ProviderUnavailable(format!("{provider}: reading response body: {err}"))
}
