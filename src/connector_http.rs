//! Paged JSON-over-HTTP connector serving every built-in [`SourceKind`].
//!
//! The request shape, record location, pagination, and field mapping come
//! from [`crate::mapping`]; this module only performs the calls. Every call
//! runs inside the connector's own [`RateLimiter`], so the per-call timeout
//! and the inter-call delay apply to each page fetch.
//!
//! Credentials are read from the environment variable named by
//! `credential_env` at fetch time and sent as the source's API-key query
//! parameter. They are never read from the config file.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::connector::Connector;
use crate::error::{FetchError, MapError};
use crate::mapping::{self, HttpMethod, Paging};
use crate::models::{CanonicalRecord, Cursor, Page, RawRecord, SourceDescriptor};
use crate::rate_limit::RateLimiter;

pub struct HttpConnector {
    descriptor: SourceDescriptor,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpConnector {
    pub fn new(descriptor: SourceDescriptor) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gdh/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let limiter = RateLimiter::new(descriptor.rate_limit);
        Ok(Self {
            descriptor,
            client,
            limiter,
        })
    }

    fn credential(&self) -> Result<Option<String>, String> {
        let Some(var) = &self.descriptor.credential_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
            _ => Err(format!("credential env var {} is not set", var)),
        }
    }

    fn build_request(
        &self,
        partition: &str,
        cursor: &Cursor,
    ) -> Result<(reqwest::RequestBuilder, u64), FetchError> {
        let kind = self.descriptor.kind;
        let ep = mapping::endpoint(kind);
        let credential = self.credential().map_err(FetchError::Transport)?;
        let position = mapping::position(ep.paging, cursor);

        let mut request = match (ep.paging, cursor) {
            // Next-page URLs already carry every query parameter.
            (Paging::NextUrl { .. }, Cursor::Page(url)) => self.client.get(url.as_str()),
            _ => {
                let url = format!("{}{}", self.descriptor.base_url, ep.path);
                match ep.method {
                    HttpMethod::Get => self.client.get(&url).query(&mapping::query_params(
                        kind,
                        partition,
                        position,
                        self.descriptor.page_size,
                    )),
                    HttpMethod::Post => {
                        let body = mapping::request_body(
                            kind,
                            partition,
                            position,
                            self.descriptor.page_size,
                            self.descriptor.time_period.as_ref(),
                        )
                        .unwrap_or(Value::Null);
                        self.client.post(&url).json(&body)
                    }
                }
            }
        };

        if let (Some(param), Some(key)) = (ep.credential_param, credential) {
            request = request.query(&[(param, key)]);
        }
        Ok((request, position))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, FetchError> {
        let response = request.send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(200).collect();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn preflight(&self) -> Result<(), String> {
        self.credential().map(|_| ())
    }

    async fn fetch(&self, partition: &str, cursor: &Cursor) -> Result<Page, FetchError> {
        let (request, position) = self.build_request(partition, cursor)?;
        let body = self.limiter.call(self.send(request)).await?;
        let (records, next) = mapping::extract_page(
            self.descriptor.kind,
            &body,
            position,
            self.descriptor.page_size,
        )?;
        debug!(
            source = %self.descriptor.id,
            partition,
            records = records.len(),
            more = next.is_some(),
            "Fetched page"
        );
        Ok(Page { records, next })
    }

    fn map(&self, raw: &RawRecord) -> Result<CanonicalRecord, MapError> {
        let mut record = mapping::map_record(self.descriptor.kind, raw)?;
        record.source = self.descriptor.id.clone();
        Ok(record)
    }
}
