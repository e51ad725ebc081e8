//! Scripted transport for unit tests

use crate::client::SigningClient;
use crate::credentials::{Credentials, StaticCredentials};
use crate::http::{HttpClient, HttpResponse};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn path(&self) -> String {
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_default()
    }

    /// Query parameter from the URL, or from a form body
    pub fn param(&self, name: &str) -> Option<String> {
        let from_url = url::Url::parse(&self.url).ok().and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        });
        from_url.or_else(|| {
            url::form_urlencoded::parse(&self.body)
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        })
    }

    pub fn has_query(&self, name: &str) -> bool {
        url::Url::parse(&self.url)
            .map(|u| u.query_pairs().any(|(k, _)| k == name))
            .unwrap_or(false)
    }

    /// Query-protocol action name
    pub fn action(&self) -> Option<String> {
        self.param("Action")
    }
}

type Handler = Box<dyn Fn(&RecordedRequest) -> HttpResponse + Send + Sync>;

pub struct MockHttpClient {
    responses: Mutex<VecDeque<HttpResponse>>,
    handler: Option<Handler>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockHttpClient {
    pub fn new(responses: Vec<HttpResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            handler: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Respond by inspecting each request; used where dispatch order is not fixed
    pub fn with_handler(
        handler: impl Fn(&RecordedRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            handler: Some(Box::new(handler)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let recorded = RecordedRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers,
            body: body.unwrap_or_default(),
        };
        self.requests.lock().push(recorded.clone());

        if let Some(handler) = &self.handler {
            return Ok(handler(&recorded));
        }
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("No more mock responses"))
    }
}

pub fn test_credentials() -> Credentials {
    Credentials::new("AKIDEXAMPLE", "SECRET")
}

fn client_over(region: &str, mock: Arc<MockHttpClient>) -> SigningClient {
    let clock: crate::Clock =
        Arc::new(|| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default());
    SigningClient::new(
        mock,
        Arc::new(StaticCredentials(test_credentials())),
        region,
    )
    .with_clock(clock)
}

/// Client at a fixed instant (2024-01-01T00:00:00Z) replaying `responses` in order
pub fn fixed_client(
    region: &str,
    responses: Vec<HttpResponse>,
) -> (SigningClient, Arc<MockHttpClient>) {
    let mock = Arc::new(MockHttpClient::new(responses));
    (client_over(region, mock.clone()), mock)
}

pub fn handler_client(
    region: &str,
    handler: impl Fn(&RecordedRequest) -> HttpResponse + Send + Sync + 'static,
) -> (SigningClient, Arc<MockHttpClient>) {
    let mock = Arc::new(MockHttpClient::with_handler(handler));
    (client_over(region, mock.clone()), mock)
}

pub fn ok(body: &str) -> HttpResponse {
    HttpResponse::new(200, body)
}
