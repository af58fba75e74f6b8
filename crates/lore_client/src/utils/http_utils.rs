use std::error::Error;

use log::error;
use reqwest::{Response, Url};

use crate::error::{ClientError, Result};

/// Joins `path` onto `base` keeping any path prefix `base` already carries.
pub fn endpoint_url(base: &str, path: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(Url::parse(&joined)?)
}

/// Logs what kind of transport failure a request ran into.
pub fn log_transport_error(url: &str, e: &reqwest::Error) {
    error!("Failed HTTP request to {}: {}", url, e);
    if let Some(source) = e.source() {
        error!("Error source: {:?}", source);
    }
    if e.is_timeout() {
        error!("Request timed out");
    }
    if e.is_connect() {
        error!("Connection error");
    }
    if e.is_body() {
        error!("Body error");
    }
    if e.is_decode() {
        error!("Decode error");
    }
}

/// Turns a non-success response into [`ClientError::Api`], passing successes through.
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        body,
    })
}
