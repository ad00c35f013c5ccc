//! Common utilities for the Proxmox VE API client
//!
//! Provides the authenticated HTTP wrapper shared by all API calls.

use crate::error::PveError;
use crate::models::ApiEnvelope;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

/// HTTP client wrapper with API token authentication
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpClient {
    /// Create a new HTTP client wrapper
    ///
    /// `token` is the full token string `user@realm!tokenid=secret`.
    pub fn new(client: Client, base_url: String, token: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from an API path (`/nodes/...`)
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}/api2/json{}", self.base_url, path)
        }
    }

    /// Get authorization header value
    pub fn auth_header(&self) -> String {
        format!("PVEAPIToken={}", self.token)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
    }

    /// Make a GET request and unwrap the `data` envelope
    pub async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, PveError> {
        let url = self.build_url(path);
        debug!("GET {}", url);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(PveError::Http)?;
        Self::decode(path, "GET", response).await
    }

    /// Make a form-encoded POST request
    pub async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, PveError> {
        let url = self.build_url(path);
        debug!("POST {} with fields: {}", url, field_names(form));

        let response = self
            .authorized(self.client.post(&url))
            .form(form)
            .send()
            .await
            .map_err(PveError::Http)?;
        Self::decode(path, "POST", response).await
    }

    /// Make a form-encoded PUT request
    pub async fn put<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, PveError> {
        let url = self.build_url(path);
        debug!("PUT {} with fields: {}", url, field_names(form));

        let response = self
            .authorized(self.client.put(&url))
            .form(form)
            .send()
            .await
            .map_err(PveError::Http)?;
        Self::decode(path, "PUT", response).await
    }

    /// Make a DELETE request
    pub async fn delete<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, PveError> {
        let url = self.build_url(path);
        debug!("DELETE {}", url);

        let response = self
            .authorized(self.client.delete(&url))
            .send()
            .await
            .map_err(PveError::Http)?;
        Self::decode(path, "DELETE", response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        path: &str,
        method: &str,
        response: Response,
    ) -> Result<T, PveError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == 401 {
            return Err(PveError::Authentication(format!(
                "{} {} rejected the API token: {}",
                method, path, body
            )));
        }
        if status == 403 {
            return Err(PveError::Authentication(format!(
                "{} {} is not permitted for this token: {}",
                method, path, body
            )));
        }
        if status == 404 || (status.is_server_error() && body.contains("does not exist")) {
            return Err(PveError::NotFound(format!("{} - {}", path, body)));
        }
        if status == 400 {
            return Err(PveError::InvalidRequest(format!(
                "{} {} failed: {}",
                method, path, body
            )));
        }
        if !status.is_success() {
            return Err(PveError::Api {
                status: status.as_u16(),
                message: format!("{} {} failed: {}", method, path, body),
            });
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body).map_err(|e| PveError::Api {
            status: status.as_u16(),
            message: format!(
                "error decoding response body: {} - Response (first 500 chars): {}",
                e,
                body.chars().take(500).collect::<String>()
            ),
        })?;
        Ok(envelope.data)
    }

    /// Build query string from filters
    pub fn build_query_string(&self, filters: &[(&str, &str)]) -> String {
        filters
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Secrets travel in form values, so only field names are logged.
fn field_names(form: &[(String, String)]) -> String {
    form.iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
