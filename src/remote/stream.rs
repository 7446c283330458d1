use async_trait::async_trait;
use reqwest::Method;
use secrecy::SecretString;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::client::ApiClient;
use super::error::RemoteResult;
use super::provider::{CursorStream, IdPage, StatusSender, StreamFilter, StreamResource};
use crate::storage::{Article, Collection, StatusKey};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkerRequest<'a> {
    key: StatusKey,
    flag: bool,
    article_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntriesRequest<'a> {
    article_ids: &'a [String],
}

/// Cursor-stream provider over HTTP/JSON.
///
/// Endpoints, relative to the base URL:
///
/// - `GET  v1/streams/{all|unread|starred}/ids?continuation=&newerThan=&count=`
/// - `GET  v1/collections`
/// - `POST v1/entries` with `{"articleIds": [...]}`
/// - `POST v1/markers` with `{"key": "read", "flag": true, "articleIds": [...]}`
#[derive(Debug, Clone)]
pub struct HttpStreamProvider {
    api: ApiClient,
}

impl HttpStreamProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Self {
        Self {
            api: ApiClient::new(http, base_url, token, timeout),
        }
    }
}

#[async_trait]
impl StatusSender for HttpStreamProvider {
    async fn send_status_batch(
        &self,
        article_ids: &[String],
        key: StatusKey,
        flag: bool,
    ) -> RemoteResult<()> {
        if article_ids.is_empty() {
            return Ok(());
        }
        let url = self.api.url("v1/markers")?;
        let body = MarkerRequest {
            key,
            flag,
            article_ids,
        };
        self.api.send(Method::POST, url, Some(&body)).await?;
        tracing::debug!(count = article_ids.len(), key = %key, flag = flag, "Sent status batch");
        Ok(())
    }
}

#[async_trait]
impl CursorStream for HttpStreamProvider {
    async fn fetch_page(
        &self,
        resource: StreamResource,
        continuation: Option<&str>,
        filter: &StreamFilter,
    ) -> RemoteResult<IdPage> {
        let mut url = self.api.url(&format!("v1/streams/{}/ids", resource.as_str()))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(continuation) = continuation {
                query.append_pair("continuation", continuation);
            }
            if let Some(newer_than) = filter.newer_than {
                query.append_pair("newerThan", &newer_than.to_string());
            }
            if let Some(count) = filter.count {
                query.append_pair("count", &count.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        self.api.send_json::<(), _>(Method::GET, url, None).await
    }

    async fn fetch_collections(&self) -> RemoteResult<Vec<Collection>> {
        let url = self.api.url("v1/collections")?;
        self.api.send_json::<(), _>(Method::GET, url, None).await
    }

    async fn fetch_entries(&self, article_ids: &[String]) -> RemoteResult<Vec<Article>> {
        if article_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.api.url("v1/entries")?;
        let body = EntriesRequest { article_ids };
        self.api.send_json(Method::POST, url, Some(&body)).await
    }
}
