//! Document retrieval.
//!
//! [`DocumentFetcher`] abstracts where raw text comes from so the parse
//! stage can run against an HTTP source in production and an in-memory
//! fixture set in tests.

use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use url::Url;

use crate::error::FetchError;

/// Raw, unparsed document body as retrieved from the source.
#[derive(Clone, Debug)]
pub struct RawDocument {
    pub document_id: String,
    pub body: String,
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, document_id: &str) -> Result<RawDocument, FetchError>;
}

/// Fetches `{base_url}{document_id}` as plain text.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| FetchError::Malformed(format!("invalid base url: {err}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| FetchError::Transient(err.to_string()))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, document_id: &str) -> Result<RawDocument, FetchError> {
        let url = self
            .base_url
            .join(document_id)
            .map_err(|err| FetchError::Malformed(err.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transient(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(FetchError::NotFound {
                id: document_id.to_string(),
            });
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchError::Transient(format!("source returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Malformed(format!("source returned {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Transient(err.to_string()))?;
        Ok(RawDocument {
            document_id: document_id.to_string(),
            body,
        })
    }
}

/// Map-backed fetcher for tests.
#[derive(Default)]
pub struct FixtureFetcher {
    documents: FxHashMap<String, String>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_document(mut self, id: impl Into<String>, body: impl Into<String>) -> Self {
        self.documents.insert(id.into(), body.into());
        self
    }
}

#[async_trait]
impl DocumentFetcher for FixtureFetcher {
    async fn fetch(&self, document_id: &str) -> Result<RawDocument, FetchError> {
        match self.documents.get(document_id) {
            Some(body) => Ok(RawDocument {
                document_id: document_id.to_string(),
                body: body.clone(),
            }),
            None => Err(FetchError::NotFound {
                id: document_id.to_string(),
            }),
        }
    }
}
