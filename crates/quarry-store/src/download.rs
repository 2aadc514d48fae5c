//! HTTP download of artifact blobs into the cache's temp area.
//!
//! Downloads stream straight to a `download-*` temp file under
//! `<cache>/tmp/`; nothing is published from here. Callers rename the temp
//! file into the content-addressed location once the digest checks out.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::blocking::Client;
use url::Url;

use crate::error::{Result, StoreError};

/// Cooperative cancellation handle, cloneable across threads.
///
/// Streaming copy loops check the flag between chunks; a cancelled download
/// removes its temp file and surfaces [`StoreError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Streams artifact URLs to temp files with a hard size cap.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    tmp_dir: PathBuf,
    max_size: u64,
    mirror_base: Option<Url>,
}

impl Downloader {
    pub fn new(client: Client, tmp_dir: PathBuf, max_size: u64, mirror_base: Option<Url>) -> Self {
        Self {
            client,
            tmp_dir,
            max_size,
            mirror_base,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Rewrite `url`'s scheme and authority onto the configured mirror.
    ///
    /// Path and query pass through verbatim. Without a mirror the URL is
    /// only parsed, never altered.
    pub fn rewrite(&self, url: &str) -> Result<Url> {
        let bad = |reason: String| StoreError::BadUrl {
            input: url.to_string(),
            reason,
        };
        let mut parsed = Url::parse(url).map_err(|err| bad(err.to_string()))?;
        let Some(base) = &self.mirror_base else {
            return Ok(parsed);
        };
        parsed
            .set_scheme(base.scheme())
            .map_err(|()| bad(format!("cannot apply mirror scheme `{}`", base.scheme())))?;
        parsed
            .set_host(base.host_str())
            .map_err(|err| bad(err.to_string()))?;
        parsed
            .set_port(base.port())
            .map_err(|()| bad("cannot apply mirror port".to_string()))?;
        Ok(parsed)
    }

    /// GET `url` into a fresh `download-*` temp file.
    ///
    /// Returns the temp path and the byte count. The caller owns the file;
    /// every error path here removes it first.
    pub fn download(
        &self,
        url: &str,
        expected_size: u64,
        cancel: &CancelToken,
    ) -> Result<(PathBuf, u64)> {
        let final_url = self.rewrite(url)?;
        tracing::debug!(url = %final_url, expected_size, "starting download");

        let response = self
            .client
            .get(final_url.clone())
            .send()
            .map_err(|err| StoreError::Transport {
                url: final_url.to_string(),
                source: err,
            })?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(StoreError::Http {
                url: final_url.to_string(),
                status: status.as_u16(),
            });
        }

        fs::create_dir_all(&self.tmp_dir)?;
        let temp = tempfile::Builder::new()
            .prefix("download-")
            .tempfile_in(&self.tmp_dir)?;

        let written = copy_limited(response, temp.as_file(), self.max_size, cancel)?;

        let (_file, path) = temp.keep().map_err(|err| err.error)?;
        tracing::debug!(url = %final_url, bytes = written, "download complete");
        Ok((path, written))
    }
}

/// Copy `reader` into `out`, refusing to pass `max_size` bytes.
///
/// Reads at most `max_size + 1` bytes so an oversized body is detected
/// without draining it.
fn copy_limited(
    mut reader: impl Read,
    mut out: &File,
    max_size: u64,
    cancel: &CancelToken,
) -> Result<u64> {
    const BUF_SIZE: usize = 64 * 1024;
    let mut buf = [0u8; BUF_SIZE];
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        written += read as u64;
        if written > max_size {
            return Err(StoreError::SizeExceeded { limit: max_size });
        }
        out.write_all(&buf[..read])?;
    }
    Ok(written)
}
