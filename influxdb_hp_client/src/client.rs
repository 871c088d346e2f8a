//! The client façade: batched fetches, grouped fetches and raw queries.

use crate::{
    decode, exec::Executor, plan, BackendSnafu, DecodeSnafu, Error, FrameSnafu, Result,
    TaskJoinSnafu,
};
use backoff::{Backoff, BackoffConfig};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use series_cache::FileCache;
use series_frame::Series;
use snafu::{ensure, ResultExt};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::ControlFlow,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often [`Client::query`] re-requests a reply that failed to parse.
const PARSE_RETRIES: usize = 4;

/// Configures and builds a [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    url: String,
    db: String,
    batch_time: Duration,
    conn_pool_size: usize,
    timeout: Duration,
    backoff_config: BackoffConfig,
    cache_dir: Option<PathBuf>,
}

impl ClientBuilder {
    /// Builder against the backend at `url` (scheme, host and port, e.g.
    /// `http://localhost:8086`) querying database `db`.
    pub fn new(url: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            db: db.into(),
            batch_time: Duration::from_secs(48 * 3600),
            conn_pool_size: 10,
            timeout: Duration::from_secs(240),
            backoff_config: BackoffConfig::default(),
            cache_dir: None,
        }
    }

    /// Duration of one fetch sub-query. Default 48 h.
    pub fn batch_time(mut self, batch_time: Duration) -> Self {
        self.batch_time = batch_time;
        self
    }

    /// Keep-alive connections to the backend; also bounds the number of
    /// requests in flight. Default 10.
    pub fn conn_pool_size(mut self, conn_pool_size: usize) -> Self {
        self.conn_pool_size = conn_pool_size;
        self
    }

    /// Per-request timeout. Default 240 s.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry schedule for failed requests.
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff_config = config;
        self
    }

    /// Cache fetched sub-query frames under `dir`. Off by default.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<Client> {
        let exec = Executor::new(
            self.url,
            self.db,
            self.conn_pool_size,
            self.timeout,
            self.backoff_config.clone(),
        )?;

        Ok(Client {
            exec,
            batch_time: self.batch_time,
            backoff_config: self.backoff_config,
            cache: self.cache_dir.map(FileCache::new),
        })
    }
}

/// Client for the InfluxDB v1 `/query` API.
///
/// `fetch` and `fetch_groups` split the requested range into grid-aligned
/// sub-queries, run them concurrently and stitch the decoded frames back
/// together; `query`/`query_raw` pass single statements through.
#[derive(Debug)]
pub struct Client {
    exec: Executor,
    batch_time: Duration,
    backoff_config: BackoffConfig,
    cache: Option<FileCache<Series>>,
}

impl Client {
    /// Client with default configuration, see [`ClientBuilder`].
    pub fn new(url: impl Into<String>, db: impl Into<String>) -> Result<Self> {
        ClientBuilder::new(url, db).build()
    }

    /// Start configuring a client.
    pub fn builder(url: impl Into<String>, db: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url, db)
    }

    fn plan(&self, sql: &str, time_range: [&str; 2], args: &[&str]) -> Result<Vec<plan::Batch>> {
        plan::plan(
            sql,
            time_range,
            args,
            self.batch_time.as_millis() as i64,
            Utc::now().timestamp_millis(),
        )
    }

    /// Fetch the points of a single series over `time_range` (inclusive,
    /// ISO strings) as one merged frame.
    ///
    /// `sql` must contain `:time_condition:` in its WHERE clause; `?`
    /// placeholders are substituted by `args` in order.
    pub async fn fetch(
        &self,
        sql: &str,
        time_range: [&str; 2],
        args: &[&str],
    ) -> Result<Series> {
        let batches = self.plan(sql, time_range, args)?;
        debug!(batches = batches.len(), "dispatching fetch");

        // columns come from whichever sub-query replies first
        let columns = Arc::new(Mutex::new(Vec::<String>::new()));

        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            let exec = self.exec.clone();
            let cache = self.cache.clone();
            let columns = Arc::clone(&columns);
            let bsql = batch.sql.clone();
            handles.push((
                tokio::spawn(async move { fetch_batch(exec, cache, columns, batch).await }),
                bsql,
            ));
        }

        let results = join_batches(handles).await?;

        Series::sorted_merge(results).context(FrameSnafu)
    }

    /// Fetch a tag-grouped query: every distinct series of every batch is
    /// decoded with its tags, grouped by `key_fn(tags)` and each group
    /// merged into one frame.
    pub async fn fetch_groups<F>(
        &self,
        sql: &str,
        time_range: [&str; 2],
        args: &[&str],
        key_fn: F,
    ) -> Result<BTreeMap<String, Series>>
    where
        F: Fn(&HashMap<String, String>) -> String,
    {
        let batches = self.plan(sql, time_range, args)?;

        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            let exec = self.exec.clone();
            let bsql = batch.sql.clone();
            handles.push((
                tokio::spawn(async move {
                    let body = exec.query_raw(&batch.sql).await?;
                    decode::tagged_series(&body).context(DecodeSnafu)
                }),
                bsql,
            ));
        }

        let mut groups: BTreeMap<String, Vec<Series>> = BTreeMap::new();
        for series in join_batches(handles).await?.into_iter().flatten() {
            groups.entry(key_fn(&series.tags)).or_default().push(series);
        }

        groups
            .into_iter()
            .map(|(key, group)| {
                Series::sorted_merge(group)
                    .context(FrameSnafu)
                    .map(|merged| (key, merged))
            })
            .collect()
    }

    /// Run a single statement and return the parsed reply document.
    ///
    /// Replies that fail to parse are re-requested a few times on the
    /// backoff schedule; a reply whose `results[0]` carries an `error`
    /// member fails with [`Error::Backend`].
    pub async fn query(&self, sql: &str, args: &[&str]) -> Result<serde_json::Value> {
        let sql = plan::substitute_args(sql, args);

        let config = BackoffConfig {
            max_retries: PARSE_RETRIES,
            ..self.backoff_config.clone()
        };
        let doc: serde_json::Value = Backoff::new(&config)
            .retry_with_backoff("influxdb query parse", || {
                let sql = sql.clone();
                async move {
                    // request errors are final here, only parse failures
                    // are worth another round trip
                    let body = match self.exec.query_raw(&sql).await {
                        Ok(body) => body,
                        Err(e) => return ControlFlow::Break(Err(e)),
                    };
                    match serde_json::from_slice::<serde_json::Value>(&body) {
                        Ok(doc) => ControlFlow::Break(Ok(doc)),
                        Err(e) => ControlFlow::Continue(Error::Parse { source: e, sql }),
                    }
                }
            })
            .await??;

        ensure!(
            doc.get("results").is_some(),
            BackendSnafu {
                message: "response has no results member",
                sql: sql.clone(),
            }
        );
        if let Some(message) = doc["results"][0].get("error").and_then(|e| e.as_str()) {
            return BackendSnafu { message, sql }.fail();
        }

        Ok(doc)
    }

    /// The set of first tag keys over `results[0].series`, empty when the
    /// reply has no series.
    pub async fn query_tags(&self, sql: &str, args: &[&str]) -> Result<BTreeSet<String>> {
        let doc = self.query(sql, args).await?;

        let mut tags = BTreeSet::new();
        if let Some(series) = doc["results"][0].get("series").and_then(|s| s.as_array()) {
            for s in series {
                if let Some(obj) = s.get("tags").and_then(|t| t.as_object()) {
                    if let Some(key) = obj.keys().next() {
                        tags.insert(key.clone());
                    }
                }
            }
        }

        Ok(tags)
    }

    /// Run one fully expanded statement and hand back the raw reply body.
    pub async fn query_raw(&self, sql: &str) -> Result<Bytes> {
        self.exec.query_raw(sql).await
    }
}

/// Fetch and decode one planned sub-query into its result slot.
async fn fetch_batch(
    exec: Executor,
    cache: Option<FileCache<Series>>,
    columns: Arc<Mutex<Vec<String>>>,
    batch: plan::Batch,
) -> Result<Series> {
    if let Some(cache) = &cache {
        match cache.get_async(&batch.sql).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(e) => warn!(sql=%batch.sql, e=%e, "ignoring unreadable cache entry"),
        }
    }

    let body = exec.query_raw(&batch.sql).await?;

    let cols = {
        let mut cols = columns.lock();
        if cols.is_empty() {
            *cols = decode::columns(&body).context(DecodeSnafu)?;
        }
        cols.clone()
    };
    if cols.is_empty() {
        // nothing in this range yet; merge drops the empty frame
        return Ok(Series::default());
    }

    let series = decode::values(&body, &cols).context(DecodeSnafu)?;

    if let Some(cache) = &cache {
        if let Err(e) = cache.set(&batch.sql, &series) {
            warn!(sql=%batch.sql, e=%e, "failed to persist cache entry");
        }
    }

    Ok(series)
}

/// Await every batch task. The first error wins; later ones are logged and
/// dropped so a single bad sub-query yields one failure, not a cascade.
async fn join_batches<T>(handles: Vec<(JoinHandle<Result<T>>, String)>) -> Result<Vec<T>> {
    let (handles, sqls): (Vec<_>, Vec<_>) = handles.into_iter().unzip();

    let mut results = Vec::with_capacity(handles.len());
    let mut first_err = None;
    for (joined, bsql) in join_all(handles).await.into_iter().zip(sqls) {
        match joined.context(TaskJoinSnafu) {
            Ok(Ok(v)) => results.push(v),
            Ok(Err(e)) | Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!(sql=%bsql, e=%e, "discarding error of failed sub-query");
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
