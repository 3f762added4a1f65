//! Edge -> center forwarding client.
//!
//! An edge replica has no store of its own. Durable writes and the doing/meta
//! reads it needs are POSTed to the center API, which answers with a
//! `{"dat": <value>, "err": "<message>"}` envelope.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CenterConfig;
use crate::error::{DispatchError, Result};
use crate::scheduler::task::{MarkDone, TaskHost, TaskHostDoing, TaskMeta};
use crate::store::{DoingFilter, RecordQuery, TaskStore, UpsertErrors};

pub const PATH_TASK_META: &str = "/ibex/v1/task/meta";
pub const PATH_TASK_HOST: &str = "/ibex/v1/task/host/";
pub const PATH_TASK_HOSTS_UPSERT: &str = "/ibex/v1/task/hosts/upsert";
pub const PATH_RECORD_LIST: &str = "/ibex/v1/table/record/list";
pub const PATH_RECORD_COUNT: &str = "/ibex/v1/table/record/count";
pub const PATH_TASK_HOST_OUTPUT: &str = "/ibex/v1/task/host/output";
pub const PATH_MARK_DONE: &str = "/ibex/v1/mark/done";

/// Response envelope of the center API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned + Default"))]
pub struct Envelope<T> {
    #[serde(default)]
    pub dat: T,
    #[serde(default)]
    pub err: String,
}

impl<T> Envelope<T> {
    pub fn ok(dat: T) -> Self {
        Self {
            dat,
            err: String::new(),
        }
    }
}

/// Streamed output of a running host. Only an existing row is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOutput {
    pub id: i64,
    pub host: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// HTTP client for the center API. Addresses are tried in order.
#[derive(Debug, Clone)]
pub struct CenterClient {
    client: reqwest::Client,
    addrs: Vec<String>,
    basic_auth: Option<(String, String)>,
}

impl CenterClient {
    pub fn new(config: &CenterConfig) -> Result<Self> {
        if config.addrs.is_empty() {
            return Err(DispatchError::validation("center api addresses are empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(2)))
            .build()?;
        Ok(Self {
            client,
            addrs: config
                .addrs
                .iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect(),
            basic_auth: config.basic_auth.clone(),
        })
    }

    /// POST `body` to `path` on the first center that answers.
    ///
    /// Transport failures and non-2xx answers move on to the next address;
    /// an `err` in the envelope is returned as is.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned + Default,
    {
        let mut last_error = None;

        for addr in &self.addrs {
            let url = format!("{addr}{path}");
            let mut request = self.client.post(&url).json(body);
            if let Some((user, pass)) = &self.basic_auth {
                request = request.basic_auth(user, Some(pass));
            }

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Center request failed");
                    last_error = Some(DispatchError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(url = %url, status = %status, body = %body, "Center returned error status");
                last_error = Some(DispatchError::CenterUnavailable(format!(
                    "{url} returned {status}: {body}"
                )));
                continue;
            }

            let envelope: Envelope<T> = response.json().await?;
            if !envelope.err.is_empty() {
                return Err(DispatchError::Center(envelope.err));
            }
            return Ok(envelope.dat);
        }

        Err(last_error.unwrap_or_else(|| {
            DispatchError::CenterUnavailable("no center reachable".to_string())
        }))
    }
}

#[async_trait]
impl TaskStore for CenterClient {
    async fn create_task_meta(&self, meta: &TaskMeta) -> Result<i64> {
        self.post(PATH_TASK_META, meta).await
    }

    async fn task_meta(&self, id: i64) -> Result<Option<TaskMeta>> {
        let metas: Vec<TaskMeta> = self
            .post(PATH_RECORD_LIST, &RecordQuery::TaskMeta { id })
            .await?;
        Ok(metas.into_iter().next())
    }

    async fn upsert_task_host(&self, host: &TaskHost) -> Result<()> {
        self.post(PATH_TASK_HOST, host).await
    }

    async fn upsert_task_hosts(&self, hosts: &[TaskHost]) -> Result<UpsertErrors> {
        self.post(PATH_TASK_HOSTS_UPSERT, hosts).await
    }

    async fn doing_records(&self, filter: &DoingFilter) -> Result<Vec<TaskHostDoing>> {
        self.post(PATH_RECORD_LIST, &RecordQuery::HostDoing(filter.clone()))
            .await
    }

    async fn count_doing(&self, filter: &DoingFilter) -> Result<u64> {
        self.post(PATH_RECORD_COUNT, &RecordQuery::HostDoing(filter.clone()))
            .await
    }

    async fn mark_done(&self, done: &MarkDone) -> Result<()> {
        self.post(PATH_MARK_DONE, done).await
    }

    async fn update_output(&self, id: i64, host: &str, stdout: &str, stderr: &str) -> Result<()> {
        let output = HostOutput {
            id,
            host: host.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        self.post(PATH_TASK_HOST_OUTPUT, &output).await
    }
}
