//! # influxdb_hp_client
//!
//! A client for the InfluxDB v1 `/query` API tuned for bulk range fetches.
//! A logically single range query is split into fixed-duration sub-queries
//! that run concurrently against a bounded connection pool; each JSON reply
//! streams through an event-driven decoder into a compact column-major
//! [`Series`], and the per-batch frames are stitched back into one
//! time-ordered result.
//!
//! ```no_run
//! # async fn example() -> Result<(), influxdb_hp_client::Error> {
//! use influxdb_hp_client::Client;
//!
//! let client = Client::new("http://localhost:8086", "test")?;
//! let series = client
//!     .fetch(
//!         "SELECT last(v) AS v FROM load WHERE :time_condition: \
//!          GROUP BY time(1s) FILL(previous)",
//!         ["2018-06-19T16:22:26Z", "2018-06-19T16:22:40Z"],
//!         &[],
//!     )
//!     .await?;
//! println!("{} rows", series.num);
//! # Ok(())
//! # }
//! ```
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;

mod client;
pub mod decode;
mod exec;
pub mod plan;
pub mod util;

pub use client::{Client, ClientBuilder};
pub use series_cache::FileCache;
pub use series_frame::Series;

/// Errors of the fetch pipeline.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("error building http client: {source}"))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("influxdb request failed: {source}, SQL \"{sql}\""))]
    Request { source: reqwest::Error, sql: String },

    #[snafu(display("influxdb http error {status}: {body}, SQL \"{sql}\""))]
    Http {
        status: u16,
        body: String,
        sql: String,
    },

    #[snafu(display("influxdb error: {message}, SQL \"{sql}\""))]
    Backend { message: String, sql: String },

    #[snafu(display("response parse error: {source}, SQL \"{sql}\""))]
    Parse {
        source: serde_json::Error,
        sql: String,
    },

    #[snafu(display("response decode failed: {source}"))]
    Decode { source: decode::DecodeError },

    #[snafu(display("cannot parse timestamp `{input}`"))]
    InvalidTimestamp { input: String },

    #[snafu(display("series merge failed: {source}"))]
    Frame { source: series_frame::Error },

    #[snafu(display("batch task aborted: {source}"))]
    TaskJoin { source: tokio::task::JoinError },
}

/// Specialized result with this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
