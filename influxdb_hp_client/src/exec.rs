//! Pooled, retrying execution of `/query` requests.

use crate::{util, HttpClientSnafu, HttpSnafu, RequestSnafu, Result};
use backoff::{Backoff, BackoffConfig};
use bytes::Bytes;
use snafu::ResultExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

/// Issues GETs against one backend with keep-alive pooling, an admission
/// bound of `conn_pool_size` concurrent requests, and exponential-backoff
/// retry of non-200 replies.
#[derive(Debug, Clone)]
pub(crate) struct Executor {
    http: reqwest::Client,
    admission: Arc<Semaphore>,
    url: String,
    db: String,
    backoff_config: BackoffConfig,
}

impl Executor {
    pub(crate) fn new(
        url: String,
        db: String,
        conn_pool_size: usize,
        timeout: Duration,
        backoff_config: BackoffConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(conn_pool_size)
            .build()
            .context(HttpClientSnafu)?;

        Ok(Self {
            http,
            admission: Arc::new(Semaphore::new(conn_pool_size)),
            url,
            db,
            backoff_config,
        })
    }

    /// GET the expanded `sql` and return the raw body of the 200 reply.
    ///
    /// Transport failures and non-200 statuses are retried on the backoff
    /// schedule; the last error surfaces once retries run out. A reply that
    /// is not parseable JSON is NOT detected here — body interpretation
    /// belongs to the caller.
    pub(crate) async fn query_raw(&self, sql: &str) -> Result<Bytes> {
        // the permit spans retries, so at most `conn_pool_size` requests
        // are in flight at once
        let _permit = self
            .admission
            .acquire()
            .await
            .expect("admission semaphore never closes");

        let url = format!(
            "{}/query?db={}&epoch=ms&q={}",
            self.url,
            self.db,
            util::url_encode(sql)
        );

        Backoff::new(&self.backoff_config)
            .retry_all_errors("influxdb query", || {
                let url = url.clone();
                async move {
                    let resp = self
                        .http
                        .get(&url)
                        .send()
                        .await
                        .context(RequestSnafu { sql })?;

                    let status = resp.status().as_u16();
                    if status != 200 {
                        let body = resp.text().await.unwrap_or_default();
                        return HttpSnafu { status, body, sql }.fail();
                    }

                    resp.bytes().await.context(RequestSnafu { sql })
                }
            })
            .await
    }
}
