//! The artifact store: fetch → verify → cache → extract.
//!
//! One store instance is shared across concurrent fetch callers; the cache
//! filesystem is the only shared resource, and every publication into it
//! happens via atomic rename. Two racing fetches of the same digest may both
//! download — the loser's rename lands byte-identical content, so the race
//! is left uncoordinated.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use url::Url;

use crate::archive::{self, ArtifactFormat};
use crate::digest::Digest;
use crate::download::{CancelToken, Downloader};
use crate::error::{Result, StoreError};
use crate::gc::{self, GcError, GcResult};
use crate::index::{PlatformArtifact, VersionEntry};
use crate::platform;
use crate::trust::{Verifier, VerifyResult};

const DEFAULT_MAX_DOWNLOAD: u64 = 500 * 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A fetched, verified, and locally materialized plugin artifact.
#[derive(Debug, Clone)]
pub struct InstalledArtifact {
    pub plugin_name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub digest: Digest,
    pub blob_path: PathBuf,
    /// Empty for raw binaries.
    pub extract_dir: Option<PathBuf>,
    pub binary_path: PathBuf,
    pub format: ArtifactFormat,
    pub size: u64,
    pub verify_result: VerifyResult,
}

/// Options for constructing an [`ArtifactStore`].
#[derive(Debug, Default)]
pub struct StoreBuilder {
    cache_dir: Option<PathBuf>,
    http_client: Option<Client>,
    verifier: Option<Verifier>,
    max_download_size: Option<u64>,
    mirror_base: Option<String>,
    timeout: Option<Duration>,
}

impl StoreBuilder {
    /// Cache root; defaults to `$HOME/.quarry/cache/artifacts`.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Inject an HTTP client (tests supply a loopback client).
    pub fn http_client(mut self, client: Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Inject a verifier; the default has an empty keyring and the
    /// `default` policy preset.
    pub fn verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Hard cap on artifact size; defaults to 500 MiB.
    pub fn max_download_size(mut self, bytes: u64) -> Self {
        self.max_download_size = Some(bytes);
        self
    }

    /// Rewrite every artifact URL's scheme and host onto this base.
    pub fn mirror_base(mut self, base: impl Into<String>) -> Self {
        self.mirror_base = Some(base.into());
        self
    }

    /// Per-request timeout for the default client; 5 minutes if unset.
    /// Ignored when a client is injected.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ArtifactStore> {
        let cache_root = self.cache_dir.unwrap_or_else(default_cache_dir);
        let client = match self.http_client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
                .build()
                .map_err(|err| StoreError::Transport {
                    url: String::new(),
                    source: err,
                })?,
        };
        let mirror_base = self
            .mirror_base
            .filter(|base| !base.is_empty())
            .map(|base| {
                Url::parse(&base).map_err(|err| StoreError::BadUrl {
                    input: base.clone(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;
        let downloader = Downloader::new(
            client,
            cache_root.join("tmp"),
            self.max_download_size.unwrap_or(DEFAULT_MAX_DOWNLOAD),
            mirror_base,
        );
        Ok(ArtifactStore {
            cache_root,
            downloader,
            verifier: self.verifier.unwrap_or_default(),
        })
    }
}

/// Content-addressed store for plugin artifacts.
pub struct ArtifactStore {
    cache_root: PathBuf,
    downloader: Downloader,
    verifier: Verifier,
}

impl ArtifactStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Content-addressed blob location: `sha256/<hh>/<hex>`.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.cache_root
            .join("sha256")
            .join(digest.shard())
            .join(digest.hex())
    }

    /// Extraction tree location: `extracted/<hh>/<hex>`. Unused for raw
    /// binaries.
    pub fn extract_path(&self, digest: &Digest) -> PathBuf {
        self.cache_root
            .join("extracted")
            .join(digest.shard())
            .join(digest.hex())
    }

    /// Whether the blob for `digest` is already cached.
    pub fn has(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Fetch for the platform this process runs on.
    pub fn fetch(&self, plugin_name: &str, entry: &VersionEntry) -> Result<InstalledArtifact> {
        let (os, arch) = platform::current();
        self.fetch_with(plugin_name, entry, os, arch, &CancelToken::new())
    }

    /// Fetch for an explicit platform.
    pub fn fetch_for(
        &self,
        plugin_name: &str,
        entry: &VersionEntry,
        os: &str,
        arch: &str,
    ) -> Result<InstalledArtifact> {
        self.fetch_with(plugin_name, entry, os, arch, &CancelToken::new())
    }

    /// Full fetch pipeline with a caller-owned cancellation handle.
    ///
    /// Policy violations do not fail the fetch; they ride along in
    /// [`InstalledArtifact::verify_result`] so operators can run a
    /// permissive policy during rollout and still see the analysis. Hard
    /// failures are platform miss, download errors, digest mismatch, and
    /// extraction errors.
    pub fn fetch_with(
        &self,
        plugin_name: &str,
        entry: &VersionEntry,
        os: &str,
        arch: &str,
        cancel: &CancelToken,
    ) -> Result<InstalledArtifact> {
        let artifact = platform::select(&entry.artifacts, os, arch)?;
        let blob = self.blob_path(&artifact.digest);

        if self.has(&artifact.digest) {
            tracing::debug!(digest = %artifact.digest, "cache hit");
        } else {
            self.download_blob(plugin_name, artifact, &blob, cancel)?;
        }

        // The cache-hit path re-reads and re-verifies so both paths produce
        // the same VerifyResult.
        let content = fs::read(&blob)?;
        let verify_result = self.verifier.verify(
            &content,
            &artifact.digest.to_string(),
            entry.signature.as_deref(),
            entry.signer_key_pem.as_deref(),
            &entry.api_version,
        );
        if !verify_result.ok() {
            tracing::warn!(
                plugin = %plugin_name,
                version = %entry.version,
                violations = verify_result.violations.len(),
                "artifact failed trust checks"
            );
        }

        let format = archive::detect_format(&blob)?;
        let (extract_dir, binary_path) = match format {
            ArtifactFormat::TarGz => {
                let dir = self.extract_path(&artifact.digest);
                if !dir.is_dir() {
                    archive::extract(&blob, &dir, cancel)?;
                }
                let binary = dir.join(basename(plugin_name));
                (Some(dir), binary)
            }
            ArtifactFormat::RawBinary => {
                archive::set_executable(&blob)?;
                (None, blob.clone())
            }
        };

        tracing::info!(
            plugin = %plugin_name,
            version = %entry.version,
            digest = %artifact.digest,
            trust = %verify_result.trust_level,
            "artifact installed"
        );

        Ok(InstalledArtifact {
            plugin_name: plugin_name.to_string(),
            version: entry.version.clone(),
            os: os.to_string(),
            arch: arch.to_string(),
            digest: artifact.digest.clone(),
            blob_path: blob,
            extract_dir,
            binary_path,
            format,
            size: artifact.size,
            verify_result,
        })
    }

    /// Remove every blob and extraction tree whose digest is not in
    /// `referenced`. Digests may carry the `sha256:` prefix or not.
    pub fn gc(
        &self,
        referenced: &HashSet<String>,
        dry_run: bool,
    ) -> std::result::Result<GcResult, GcError> {
        gc::run(&self.cache_root, referenced, dry_run)
    }

    fn download_blob(
        &self,
        plugin_name: &str,
        artifact: &PlatformArtifact,
        blob: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        tracing::info!(
            plugin = %plugin_name,
            url = %artifact.url,
            digest = %artifact.digest,
            "downloading artifact"
        );
        let (tmp, _written) = self
            .downloader
            .download(&artifact.url, artifact.size, cancel)?;

        let published = self.publish_blob(&tmp, artifact, blob);
        if published.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        published
    }

    fn publish_blob(&self, tmp: &Path, artifact: &PlatformArtifact, blob: &Path) -> Result<()> {
        let computed = Digest::compute_stream(BufReader::new(File::open(tmp)?))?;
        if computed != artifact.digest {
            return Err(StoreError::DigestMismatch {
                expected: artifact.digest.to_string(),
                actual: computed.to_string(),
            });
        }
        let parent = blob.parent().expect("blob path always has a parent");
        fs::create_dir_all(parent)?;
        match fs::rename(tmp, blob) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // A concurrent GC can sweep the freshly created shard dir
                // out from under the rename; recreate and retry once.
                fs::create_dir_all(parent)?;
                fs::rename(tmp, blob)?;
            }
            Err(err) => return Err(err.into()),
        }
        // The temp file is created 0600; published blobs are 0644.
        set_blob_mode(blob)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_blob_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_blob_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn basename(plugin_name: &str) -> &str {
    plugin_name
        .rsplit('/')
        .next()
        .unwrap_or(plugin_name)
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quarry")
        .join("cache")
        .join("artifacts")
}
