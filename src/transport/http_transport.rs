use std::time::Duration;

use anyhow::Result;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde_json::{Map, Value};

use super::{ActionOutcome, FetchPage, SyncTransport, TransportError};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// REST backend connector. Polls `GET /entities/{kind}` and submits actions
/// with `POST /entities/{kind}/{id}/actions/{action}`, carrying the bearer
/// credential on every request. The request timeout is independent of the
/// polling interval; a timed-out request simply counts as one failure.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    bearer_token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, bearer_token: &str) -> Result<Self> {
        Self::with_timeout(base_url, bearer_token, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, bearer_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.to_string(),
        })
    }

    fn entity_url(&self, kind: &str) -> String {
        format!("{}/entities/{}", self.base_url, kind)
    }

    fn check_status(response: &Response) -> Result<(), TransportError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            return Err(TransportError::Http(status.as_u16()));
        }
        Ok(())
    }

    fn request_error(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Connection(e.to_string())
        }
    }
}

impl SyncTransport for HttpTransport {
    fn fetch(
        &self,
        kind: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<FetchPage, TransportError> {
        log::debug!("HTTP FETCH: kind='{}' since={:?} limit={}", kind, since, limit);
        let mut request = self
            .client
            .get(self.entity_url(kind))
            .bearer_auth(&self.bearer_token)
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = since {
            request = request.query(&[("since", cursor)]);
        }
        let response = request.send().map_err(Self::request_error)?;
        Self::check_status(&response)?;

        let body: Value = response
            .json()
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let page = match body {
            Value::Array(items) => FetchPage {
                items,
                next_cursor: None,
            },
            Value::Object(_) => serde_json::from_value(body)
                .map_err(|e| TransportError::Malformed(e.to_string()))?,
            other => {
                return Err(TransportError::Malformed(format!(
                    "expected array or page object, got {}",
                    other
                )))
            }
        };
        log::debug!("HTTP FETCH RESULT: kind='{}' {} items", kind, page.items.len());
        Ok(page)
    }

    fn submit(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, TransportError> {
        log::debug!("HTTP SUBMIT: kind='{}' id='{}' action='{}'", kind, id, action);
        let url = format!("{}/{}/actions/{}", self.entity_url(kind), id, action);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.bearer_token)
            .json(params)
            .send()
            .map_err(Self::request_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Auth(status.as_u16()));
        }
        if status.is_client_error() {
            // Authoritative rejection: the server refused this mutation.
            let message = response
                .json::<ActionOutcome>()
                .ok()
                .and_then(|outcome| outcome.message)
                .unwrap_or_else(|| status.to_string());
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            return Err(TransportError::Http(status.as_u16()));
        }
        response
            .json()
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() -> Result<()> {
        let transport = HttpTransport::new("https://fleet.example.com/api/", "token")?;
        assert_eq!(
            transport.entity_url("vehicle"),
            "https://fleet.example.com/api/entities/vehicle"
        );
        Ok(())
    }
}
