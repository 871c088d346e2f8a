//! Content-addressed filesystem cache for fetched series.
//!
//! Values are stored under a 128-bit fingerprint of their key string, split
//! into a two-character shard directory plus file name:
//! `{root}/{b64[..2]}/{b64[2..]}` where `b64` is the 22-character URL-safe
//! base64 of the fingerprint. Fingerprints are trusted to be collision-free;
//! no version header is written, so callers must keep the value codec
//! stable.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use series_frame::Series;
use siphasher::sip128::{Hasher128, SipHasher24};
use snafu::{ResultExt, Snafu};
use std::{
    fs::File,
    hash::Hasher,
    io::{BufReader, BufWriter, Read, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// Cache access errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("cache i/o failure for {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("no cache entry for key `{key}`"))]
    Missing { key: String },

    #[snafu(display("cache value codec failure: {source}"))]
    Value { source: series_frame::Error },

    #[snafu(display("background cache read failed: {source}"))]
    Join { source: tokio::task::JoinError },
}

/// Specialized result with the cache [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A value that can live in a [`FileCache`].
pub trait CacheValue: Sized + Send + 'static {
    /// Serialize into `w`.
    fn encode<W: Write>(&self, w: &mut W) -> Result<()>;

    /// Deserialize from `r`.
    fn decode<R: Read>(r: &mut R) -> Result<Self>;
}

impl CacheValue for Series {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.write_to(w).context(ValueSnafu)
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Self::read_from(r).context(ValueSnafu)
    }
}

/// Filesystem KV keyed by a 128-bit fingerprint of the key string.
///
/// Readers and writers do not interlock; per-key paths are unique and writes
/// go through a temp file plus atomic rename, so concurrent access never
/// observes a torn entry.
pub struct FileCache<T> {
    root: PathBuf,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for FileCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache").field("root", &self.root).finish()
    }
}

impl<T> Clone for FileCache<T> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T: CacheValue> FileCache<T> {
    /// Cache rooted at `root`. Directories are created lazily on first
    /// [`Self::set`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _phantom: PhantomData,
        }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// URL-safe base64 of the 128-bit key fingerprint, 22 characters.
    pub fn fingerprint(key: &str) -> String {
        let mut hasher = SipHasher24::new();
        hasher.write(key.as_bytes());
        let fp = hasher.finish128();

        let mut b = base64::encode_config(fp.h1.to_le_bytes(), base64::URL_SAFE_NO_PAD);
        b.push_str(&base64::encode_config(
            fp.h2.to_le_bytes(),
            base64::URL_SAFE_NO_PAD,
        ));
        b
    }

    fn shard_and_file(&self, key: &str) -> (PathBuf, PathBuf) {
        let b64 = Self::fingerprint(key);
        let shard = self.root.join(&b64[..2]);
        let file = shard.join(&b64[2..]);
        (shard, file)
    }

    /// Whether an entry for `key` exists.
    pub fn have(&self, key: &str) -> bool {
        self.shard_and_file(key).1.is_file()
    }

    /// Read the entry for `key`, `None` when absent.
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        let (_, file) = self.shard_and_file(key);
        let f = match File::open(&file) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io {
                path: file,
                source: e,
            }),
        };
        let mut r = BufReader::new(f);
        T::decode(&mut r).map(Some)
    }

    /// [`Self::get`] off the async runtime's blocking pool.
    pub async fn get_async(&self, key: &str) -> Result<Option<T>> {
        let this = self.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || this.get(&key))
            .await
            .context(JoinSnafu)?
    }

    /// Like [`Self::get_async`], but an absent key is an error.
    pub async fn get_async_or_missing(&self, key: &str) -> Result<T> {
        self.get_async(key)
            .await?
            .ok_or_else(|| Error::Missing { key: key.to_owned() })
    }

    /// Store `value` under `key`, creating the shard directory as needed.
    pub fn set(&self, key: &str, value: &T) -> Result<()> {
        let (shard, file) = self.shard_and_file(key);
        std::fs::create_dir_all(&shard).context(IoSnafu { path: shard.clone() })?;

        let mut tmp = NamedTempFile::new_in(&shard).context(IoSnafu { path: shard })?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            value.encode(&mut w)?;
            w.flush().context(IoSnafu { path: file.clone() })?;
        }
        tmp.persist(&file).map_err(|e| Error::Io {
            path: file,
            source: e.error,
        })?;

        Ok(())
    }
}
