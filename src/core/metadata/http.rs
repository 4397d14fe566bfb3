//! HTTP callback client for the metadata service

use super::{CommitRecord, Location, MetadataService};
use crate::config::MetadataConfig;
use crate::core::listing::RawEntry;
use crate::error::{MetadataError, Result, StowageError};
use crate::Options;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Metadata service reached through two callback URLs
///
/// - `GET  crud_callback?path=..`     resolves a location
/// - `PUT  crud_callback`             receives a commit record
/// - `GET  metadata_callback?path=..` lists entries
#[derive(Debug, Clone)]
pub struct HttpMetadataService {
    http: reqwest::Client,
    crud_callback: String,
    metadata_callback: String,
}

impl HttpMetadataService {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                StowageError::Configuration(format!("cannot build metadata client: {}", e))
            })?;

        Ok(HttpMetadataService {
            http,
            crud_callback: config.crud_callback.clone(),
            metadata_callback: config.metadata_callback.clone(),
        })
    }

    fn query<'a>(path: &'a str, options: &'a Options) -> Vec<(&'a str, &'a str)> {
        let mut query: Vec<(&str, &str)> = vec![("path", path)];
        query.extend(
            options
                .iter()
                .filter(|(k, _)| k.as_str() != "path")
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        query
    }
}

/// Turn a non-success reply into `MetadataError::Status`
async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, MetadataError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(MetadataError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl MetadataService for HttpMetadataService {
    async fn resolve(&self, path: &str, options: &Options) -> std::result::Result<Location, MetadataError> {
        debug!(path, "resolving location through crud callback");
        let response = self
            .http
            .get(&self.crud_callback)
            .query(&Self::query(path, options))
            .send()
            .await?;
        Ok(check(response).await?.json::<Location>().await?)
    }

    async fn commit(&self, record: &CommitRecord) -> std::result::Result<(), MetadataError> {
        debug!(address = %record.content_address(), "sending commit record");
        let response = self
            .http
            .put(&self.crud_callback)
            .json(record)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn list(&self, path: &str, options: &Options) -> std::result::Result<Vec<RawEntry>, MetadataError> {
        debug!(path, "fetching listing through metadata callback");
        let response = self
            .http
            .get(&self.metadata_callback)
            .query(&Self::query(path, options))
            .send()
            .await?;
        Ok(check(response).await?.json::<Vec<RawEntry>>().await?)
    }
}
