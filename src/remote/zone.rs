use async_trait::async_trait;
use reqwest::Method;
use secrecy::SecretString;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::client::ApiClient;
use super::error::RemoteResult;
use super::provider::{DeltaZone, RecordKey, StatusRecord, StatusSender, ZoneChanges, ZoneRecord};
use crate::storage::StatusKey;

#[derive(Serialize)]
struct ChangesRequest<'a> {
    token: Option<&'a str>,
}

#[derive(Serialize)]
struct ModifyRequest<'a> {
    save: &'a [ZoneRecord],
    delete: &'a [RecordKey],
}

/// Delta-zone provider over HTTP/JSON.
///
/// Endpoints, relative to the base URL:
///
/// - `POST v1/zones/{zone}/changes` with `{"token": ...}`
/// - `POST v1/zones/{zone}/modify` with `{"save": [...], "delete": [...]}`
/// - `PUT  v1/zones/{zone}`
#[derive(Debug, Clone)]
pub struct HttpZoneProvider {
    api: ApiClient,
    zone: String,
}

impl HttpZoneProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        token: Option<SecretString>,
        timeout: Duration,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            api: ApiClient::new(http, base_url, token, timeout),
            zone: zone.into(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn zone_url(&self, suffix: &str) -> RemoteResult<Url> {
        let mut url = self.api.url("v1/zones/")?;
        // Push the zone name as one segment so reserved characters are escaped.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.zone);
            if !suffix.is_empty() {
                segments.push(suffix);
            }
        }
        Ok(url)
    }
}

/// Records that carry one status change for many articles.
///
/// `Deleted` maps to record deletions; the other keys are saved as partial
/// status records.
fn status_records(article_ids: &[String], key: StatusKey, flag: bool) -> (Vec<ZoneRecord>, Vec<RecordKey>) {
    let mut save = Vec::new();
    let mut delete = Vec::new();
    for id in article_ids {
        let mut record = StatusRecord {
            article_id: id.clone(),
            ..Default::default()
        };
        match key {
            StatusKey::Read => record.read = Some(flag),
            StatusKey::Starred => record.starred = Some(flag),
            StatusKey::New => {}
            StatusKey::Deleted => {
                if flag {
                    delete.push(RecordKey::Status(id.clone()));
                    delete.push(RecordKey::Article(id.clone()));
                }
                continue;
            }
        }
        save.push(ZoneRecord::Status(record));
    }
    (save, delete)
}

#[async_trait]
impl StatusSender for HttpZoneProvider {
    async fn send_status_batch(
        &self,
        article_ids: &[String],
        key: StatusKey,
        flag: bool,
    ) -> RemoteResult<()> {
        let (save, delete) = status_records(article_ids, key, flag);
        if save.is_empty() && delete.is_empty() {
            return Ok(());
        }
        self.modify(&save, &delete).await
    }
}

#[async_trait]
impl DeltaZone for HttpZoneProvider {
    async fn fetch_changes(&self, token: Option<&str>) -> RemoteResult<ZoneChanges> {
        let url = self.zone_url("changes")?;
        let changes: ZoneChanges = self
            .api
            .send_json(Method::POST, url, Some(&ChangesRequest { token }))
            .await?;
        tracing::debug!(
            zone = %self.zone,
            changed = changes.changed.len(),
            deleted = changes.deleted.len(),
            more_coming = changes.more_coming,
            "Fetched zone changes"
        );
        Ok(changes)
    }

    async fn modify(&self, save: &[ZoneRecord], delete: &[RecordKey]) -> RemoteResult<()> {
        let url = self.zone_url("modify")?;
        self.api
            .send(Method::POST, url, Some(&ModifyRequest { save, delete }))
            .await?;
        Ok(())
    }

    async fn create_zone(&self) -> RemoteResult<()> {
        let url = self.zone_url("")?;
        self.api.send::<()>(Method::PUT, url, None).await?;
        tracing::info!(zone = %self.zone, "Created zone");
        Ok(())
    }
}
