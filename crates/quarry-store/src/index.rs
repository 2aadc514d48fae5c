//! Registry index wire model.
//!
//! The index is a JSON document published by the registry; the store only
//! ever reads it. Schema versions "1" and "2" parse through the same
//! structs: the fields version 2 added are optional everywhere, unknown
//! fields are ignored, and absent optionals default to their zero values.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::digest::Digest;
use crate::error::{Result, StoreError};

/// Root of the registry index document.
#[derive(Debug, Clone)]
pub struct RegistryIndex {
    pub schema_version: String,
    pub generated_at: OffsetDateTime,
    pub plugins: Vec<PluginEntry>,
}

impl RegistryIndex {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: RawIndex = serde_json::from_slice(bytes)?;
        raw.try_into()
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let raw: RawIndex = serde_json::from_reader(reader)?;
        raw.try_into()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Download the index over HTTP. The URL is used as-is; mirror
    /// rewriting applies to artifacts, not to the index itself.
    pub fn fetch(client: &Client, url: &str) -> Result<Self> {
        let response = client.get(url).send().map_err(|err| StoreError::Transport {
            url: url.to_string(),
            source: err,
        })?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(StoreError::Http {
                url: url.to_string(),
                status,
            });
        }
        let bytes = response.bytes().map_err(|err| StoreError::Transport {
            url: url.to_string(),
            source: err,
        })?;
        Self::from_slice(&bytes)
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginEntry> {
        self.plugins.iter().find(|plugin| plugin.name == name)
    }
}

/// One plugin and its published versions.
#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub name: String,
    pub description: String,
    pub homepage: String,
    pub versions: Vec<VersionEntry>,
    pub track: String,
    pub tags: Vec<String>,
    pub maintainers: Vec<String>,
    pub license: String,
    pub repository: String,
}

impl PluginEntry {
    pub fn version(&self, version: &str) -> Option<&VersionEntry> {
        self.versions.iter().find(|entry| entry.version == version)
    }
}

/// One published version of a plugin.
///
/// `signature` and `signer_key_pem` travel together: an entry carrying one
/// without the other is rejected at parse time.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub version: String,
    pub api_version: String,
    pub published_at: OffsetDateTime,
    pub digest: Digest,
    pub capabilities: Vec<String>,
    pub risk_class: String,
    pub artifacts: Vec<PlatformArtifact>,
    pub signature: Option<Vec<u8>>,
    pub signer_key_pem: Option<Vec<u8>>,
    pub minimum_core_version: String,
    pub changelog_url: String,
}

/// One platform-specific artifact within a version.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformArtifact {
    pub os: String,
    pub arch: String,
    pub url: String,
    pub size: u64,
    pub digest: Digest,
}

#[derive(Deserialize)]
struct RawIndex {
    schema_version: String,
    #[serde(with = "time::serde::rfc3339")]
    generated_at: OffsetDateTime,
    #[serde(default)]
    plugins: Vec<RawPluginEntry>,
}

impl TryFrom<RawIndex> for RegistryIndex {
    type Error = StoreError;

    fn try_from(raw: RawIndex) -> Result<Self> {
        Ok(Self {
            schema_version: raw.schema_version,
            generated_at: raw.generated_at,
            plugins: raw
                .plugins
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

#[derive(Deserialize)]
struct RawPluginEntry {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    homepage: String,
    #[serde(default)]
    versions: Vec<RawVersionEntry>,
    #[serde(default)]
    track: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    maintainers: Vec<String>,
    #[serde(default)]
    license: String,
    #[serde(default)]
    repository: String,
}

impl TryFrom<RawPluginEntry> for PluginEntry {
    type Error = StoreError;

    fn try_from(raw: RawPluginEntry) -> Result<Self> {
        Ok(Self {
            versions: raw
                .versions
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<Vec<_>>>()?,
            name: raw.name,
            description: raw.description,
            homepage: raw.homepage,
            track: raw.track,
            tags: raw.tags,
            maintainers: raw.maintainers,
            license: raw.license,
            repository: raw.repository,
        })
    }
}

#[derive(Deserialize)]
struct RawVersionEntry {
    version: String,
    api_version: String,
    #[serde(with = "time::serde::rfc3339")]
    published_at: OffsetDateTime,
    digest: Digest,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    risk_class: String,
    #[serde(default)]
    artifacts: Vec<PlatformArtifact>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    signer_key_pem: Option<String>,
    #[serde(default)]
    minimum_core_version: String,
    #[serde(default)]
    changelog_url: String,
}

impl TryFrom<RawVersionEntry> for VersionEntry {
    type Error = StoreError;

    fn try_from(raw: RawVersionEntry) -> Result<Self> {
        if raw.signature.is_some() != raw.signer_key_pem.is_some() {
            return Err(malformed(format!(
                "version `{}` carries a signature without a signer key (or vice versa)",
                raw.version
            )));
        }
        let signature = decode_base64_field(raw.signature.as_deref(), &raw.version, "signature")?;
        let signer_key_pem =
            decode_base64_field(raw.signer_key_pem.as_deref(), &raw.version, "signer_key_pem")?;
        Ok(Self {
            version: raw.version,
            api_version: raw.api_version,
            published_at: raw.published_at,
            digest: raw.digest,
            capabilities: raw.capabilities,
            risk_class: raw.risk_class,
            artifacts: raw.artifacts,
            signature,
            signer_key_pem,
            minimum_core_version: raw.minimum_core_version,
            changelog_url: raw.changelog_url,
        })
    }
}

fn decode_base64_field(
    value: Option<&str>,
    version: &str,
    field: &str,
) -> Result<Option<Vec<u8>>> {
    value
        .map(|encoded| {
            STANDARD.decode(encoded.trim()).map_err(|err| {
                malformed(format!(
                    "version `{version}`: {field} is not valid base64: {err}"
                ))
            })
        })
        .transpose()
}

fn malformed(message: String) -> StoreError {
    StoreError::Index(serde::de::Error::custom(message))
}
