use crate::ElogError;
use reqwest::StatusCode;
use serde_json::Value;
use std::process::Command;
use std::sync::Mutex;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://pswww.slac.stanford.edu";
pub const DEFAULT_KERBEROS_PRINCIPAL: &str = "HTTP@pswww.slac.stanford.edu";

const MAX_ERROR_BODY: usize = 500;

/// A JSON-over-HTTP endpoint. Implemented by `ElogClient` and by test fakes.
pub trait JsonApi: Send + Sync {
    fn get(&self, endpoint: &str, params: &[(&str, &str)], require_auth: bool) -> Result<Value, ElogError>;

    fn get_public(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value, ElogError> {
        self.get(endpoint, params, false)
    }
}

/// Supplies authentication headers; `invalidate` forces the next call to
/// obtain fresh ones.
pub trait AuthProvider: Send + Sync {
    fn headers(&self) -> Result<Vec<(String, String)>, ElogError>;
    fn invalidate(&self);
}

/// Kerberos-backed credentials. The negotiate token itself is obtained outside
/// this process and handed in as a ready `Authorization` header value.
pub struct KerberosAuth {
    principal: String,
    negotiated_header: Option<String>,
    cached: Mutex<Option<Vec<(String, String)>>>,
}

impl KerberosAuth {
    pub fn new(principal: &str, negotiated_header: Option<String>) -> Self {
        Self {
            principal: principal.to_string(),
            negotiated_header,
            cached: Mutex::new(None),
        }
    }

    fn has_valid_ticket() -> bool {
        Command::new("klist")
            .arg("-s")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

impl AuthProvider for KerberosAuth {
    fn headers(&self) -> Result<Vec<(String, String)>, ElogError> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(headers) = cached.as_ref() {
            return Ok(headers.clone());
        }

        if !Self::has_valid_ticket() {
            return Err(ElogError::Authentication(
                "Kerberos authentication not found or expired. Please run 'kinit' to authenticate.".to_string(),
            ));
        }

        let header = self.negotiated_header.clone().ok_or_else(|| {
            ElogError::Authentication(format!(
                "No negotiated Authorization header available for {} (set FETCH_ELOG_AUTH_HEADER)",
                self.principal
            ))
        })?;
        let headers = vec![("Authorization".to_string(), header)];
        *cached = Some(headers.clone());
        Ok(headers)
    }

    fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Blocking client for the elog web service.
pub struct ElogClient {
    base_url: String,
    http: reqwest::blocking::Client,
    auth: Box<dyn AuthProvider>,
}

impl ElogClient {
    pub fn new(base_url: &str, auth: Box<dyn AuthProvider>) -> Result<Self, ElogError> {
        let http = reqwest::blocking::Client::builder().build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            auth,
        })
    }

    fn send(
        &self,
        url: &str,
        params: &[(&str, &str)],
        headers: &[(String, String)],
    ) -> Result<reqwest::blocking::Response, ElogError> {
        let mut request = self.http.get(url).query(params);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        Ok(request.send()?)
    }
}

impl JsonApi for ElogClient {
    fn get(&self, endpoint: &str, params: &[(&str, &str)], require_auth: bool) -> Result<Value, ElogError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let headers = if require_auth { self.auth.headers()? } else { Vec::new() };
        let mut response = self.send(&url, params, &headers)?;

        if response.status() == StatusCode::UNAUTHORIZED && require_auth {
            debug!(endpoint, "got 401, refreshing auth headers");
            self.auth.invalidate();
            let headers = self.auth.headers()?;
            response = self.send(&url, params, &headers)?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(ElogError::Authentication(format!(
                    "Access denied for {}. Check if you have permission.",
                    endpoint
                )));
            }
        }

        if response.status() == StatusCode::FORBIDDEN {
            return Err(ElogError::Authentication(format!(
                "Access denied to {}. You may not have permission.",
                endpoint
            )));
        }

        let status = response.status();
        if !status.is_success() {
            let body: String = response.text().unwrap_or_default().chars().take(MAX_ERROR_BODY).collect();
            return Err(ElogError::Api {
                status: Some(status.as_u16()),
                message: format!("API request failed: {}", body),
            });
        }

        Ok(response.json()?)
    }
}
