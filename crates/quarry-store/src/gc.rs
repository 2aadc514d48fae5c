//! Referential garbage collection over the sharded cache.
//!
//! The caller supplies the set of digests to keep (typically gathered from
//! an installed-plugin manifest); everything else under `sha256/` and
//! `extracted/` goes. In-flight `.extract-*` temp directories and stray
//! non-hex entries are left alone.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// What one collection pass removed (or would remove, for dry runs).
#[derive(Debug, Clone, Default)]
pub struct GcResult {
    /// Hex digests of removed blob files.
    pub removed_blobs: Vec<String>,
    /// Hex digests of removed extraction trees.
    pub removed_dirs: Vec<String>,
    pub bytes_reclaimed: u64,
}

/// A collection pass that hit a filesystem error.
///
/// `partial` holds everything processed before the failure.
#[derive(Debug, Error)]
#[error("garbage collection aborted: {source}")]
pub struct GcError {
    pub partial: GcResult,
    #[source]
    pub source: io::Error,
}

pub(crate) fn run(
    cache_root: &Path,
    referenced: &HashSet<String>,
    dry_run: bool,
) -> Result<GcResult, GcError> {
    let referenced: HashSet<String> = referenced
        .iter()
        .map(|digest| {
            digest
                .strip_prefix("sha256:")
                .unwrap_or(digest)
                .to_ascii_lowercase()
        })
        .collect();

    let mut result = GcResult::default();
    let outcome = sweep(cache_root, &referenced, dry_run, &mut result);
    match outcome {
        Ok(()) => {
            tracing::info!(
                removed_blobs = result.removed_blobs.len(),
                removed_dirs = result.removed_dirs.len(),
                bytes = result.bytes_reclaimed,
                dry_run,
                "cache gc finished"
            );
            Ok(result)
        }
        Err(source) => Err(GcError {
            partial: result,
            source,
        }),
    }
}

fn sweep(
    cache_root: &Path,
    referenced: &HashSet<String>,
    dry_run: bool,
    result: &mut GcResult,
) -> io::Result<()> {
    sweep_section(
        &cache_root.join("sha256"),
        referenced,
        dry_run,
        Section::Blobs,
        result,
    )?;
    sweep_section(
        &cache_root.join("extracted"),
        referenced,
        dry_run,
        Section::Extracted,
        result,
    )
}

#[derive(Clone, Copy)]
enum Section {
    Blobs,
    Extracted,
}

fn sweep_section(
    section_root: &Path,
    referenced: &HashSet<String>,
    dry_run: bool,
    section: Section,
    result: &mut GcResult,
) -> io::Result<()> {
    if !section_root.is_dir() {
        return Ok(());
    }
    for shard in sorted_entries(section_root)? {
        // Stray files at the shard root are not ours to touch.
        if !shard.is_dir() {
            continue;
        }
        for entry in sorted_entries(&shard)? {
            let Some(name) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            // In-flight temp trees keep their dot prefix until publication.
            if name.starts_with('.') || !is_hex_64(name) {
                continue;
            }
            if referenced.contains(name) {
                continue;
            }
            match section {
                Section::Blobs => {
                    result.bytes_reclaimed += fs::metadata(&entry)?.len();
                    if !dry_run {
                        fs::remove_file(&entry)?;
                    }
                    result.removed_blobs.push(name.to_string());
                }
                Section::Extracted => {
                    result.bytes_reclaimed += dir_size(&entry)?;
                    if !dry_run {
                        fs::remove_dir_all(&entry)?;
                    }
                    result.removed_dirs.push(name.to_string());
                }
            }
            tracing::debug!(digest = name, dry_run, "collected cache entry");
        }
        if !dry_run && fs::read_dir(&shard)?.next().is_none() {
            fs::remove_dir(&shard)?;
        }
    }
    Ok(())
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<std::path::PathBuf>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();
    Ok(entries)
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::other)?.len();
        }
    }
    Ok(total)
}

fn is_hex_64(name: &str) -> bool {
    name.len() == 64 && name.chars().all(|ch| ch.is_ascii_hexdigit())
}
