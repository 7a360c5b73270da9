use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::config::Config;
use crate::error::HarvestError;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> Result<&str, HarvestError> {
        std::str::from_utf8(&self.body).map_err(|err| HarvestError::Encoding(err.to_string()))
    }
}

/// Blocking GET with query parameters; the only network seam of the crate.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, params: &[(&str, &str)]) -> Result<HttpResponse, HarvestError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent).map_err(|err| HarvestError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self, HarvestError> {
        Self::new(&config.user_agent, config.timeout())
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, params: &[(&str, &str)]) -> Result<HttpResponse, HarvestError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
