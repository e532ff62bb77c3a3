// Talking to the check-in backend.
//
// Everything above this module only sees status codes and bodies, which lets the
// tests swap in a scripted backend instead of a real server.

use crate::error::TransportError;
use crate::evidence::EvidenceArtifact;
use reqwest::blocking::{multipart, Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub type Query<'a> = &'a [(&'a str, &'a str)];

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub trait Backend {
    fn get(&self, path: &str, query: Query) -> Result<HttpResponse, TransportError>;

    fn post(&self, path: &str, query: Query) -> Result<HttpResponse, TransportError>;

    fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError>;

    // `input_data` goes in as a text field next to the video, the way the
    // tentative check-in endpoint wants it.
    fn post_evidence(
        &self,
        path: &str,
        input_data: &serde_json::Value,
        evidence: &EvidenceArtifact,
    ) -> Result<HttpResponse, TransportError>;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        // The backend is sometimes served through an ngrok tunnel, which otherwise
        // answers with an HTML interstitial instead of JSON.
        headers.insert("ngrok-skip-browser-warning", HeaderValue::from_static("1"));

        // The cookie store is what keeps the admin session alive between calls.
        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|source| TransportError::Request {
                path: base_url.to_owned(),
                source,
            })?;

        Ok(HttpBackend {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, path: &str, request: RequestBuilder) -> Result<HttpResponse, TransportError> {
        let to_error = |source: reqwest::Error| {
            if source.is_connect() || source.is_timeout() {
                TransportError::Unreachable(format!("{}: {}", path, source))
            } else {
                TransportError::Request {
                    path: path.to_owned(),
                    source,
                }
            }
        };

        let response = request.send().map_err(to_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(to_error)?.to_vec();
        tracing::debug!("{} -> {} ({} bytes)", path, status, body.len());

        Ok(HttpResponse { status, body })
    }
}

impl Backend for HttpBackend {
    fn get(&self, path: &str, query: Query) -> Result<HttpResponse, TransportError> {
        self.send(path, self.client.get(self.url(path)).query(query))
    }

    fn post(&self, path: &str, query: Query) -> Result<HttpResponse, TransportError> {
        self.send(path, self.client.post(self.url(path)).query(query))
    }

    fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        // .json() sets Content-Type: application/json for us
        self.send(path, self.client.post(self.url(path)).json(body))
    }

    fn post_evidence(
        &self,
        path: &str,
        input_data: &serde_json::Value,
        evidence: &EvidenceArtifact,
    ) -> Result<HttpResponse, TransportError> {
        // The artifact's bytes go out exactly as recorded, no re-encoding.
        let video = multipart::Part::bytes(evidence.bytes().to_vec())
            .file_name(evidence.file_name())
            .mime_str(evidence.mime())
            .map_err(|source| TransportError::Request {
                path: path.to_owned(),
                source,
            })?;
        let form = multipart::Form::new()
            .text("input_data", serde_json::to_string(input_data)?)
            .part("raw_video", video);

        self.send(path, self.client.post(self.url(path)).multipart(form))
    }
}
