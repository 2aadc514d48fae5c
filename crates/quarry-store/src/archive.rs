//! Archive format detection and atomic, traversal-safe tar.gz extraction.
//!
//! Extraction works entirely inside a `.extract-*` sibling of the final
//! destination and renames the tree into place only when every entry landed
//! cleanly. Entry names are normalized lexically before anything touches the
//! filesystem; nothing here calls `realpath`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;

use crate::download::CancelToken;
use crate::error::{Result, StoreError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// On-disk shape of an artifact blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// A bare executable; published in place.
    RawBinary,
    /// A gzip-compressed tarball; extracted next to the blob.
    TarGz,
}

/// Sniff the first two bytes of `path`.
///
/// Gzip magic means [`ArtifactFormat::TarGz`]; any other content is treated
/// as a raw binary. An empty file is an error.
pub fn detect_format(path: &Path) -> Result<ArtifactFormat> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        let read = file.read(&mut magic[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    if filled == 0 {
        return Err(StoreError::FormatDetect);
    }
    if filled == magic.len() && magic == GZIP_MAGIC {
        Ok(ArtifactFormat::TarGz)
    } else {
        Ok(ArtifactFormat::RawBinary)
    }
}

/// Extract a tar.gz archive into `dst_dir`, atomically.
///
/// Returns the normalized relative paths of the regular files and symlinks
/// that were written (directories are not listed). `cancel` is checked
/// between entries; a cancelled extraction aborts mid-archive. Any failure
/// leaves `dst_dir` untouched; the temp tree is removed on the way out.
pub fn extract(src_archive: &Path, dst_dir: &Path, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
    let parent = dst_dir.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    // Dropping the TempDir removes the half-built tree on every error path.
    let tmp = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)?;

    let extracted = unpack_entries(src_archive, tmp.path(), cancel)?;

    let tmp_path = tmp.keep();
    if dst_dir.exists() {
        let _ = fs::remove_dir_all(dst_dir);
    }
    if let Err(err) = fs::rename(&tmp_path, dst_dir) {
        let _ = fs::remove_dir_all(&tmp_path);
        return Err(err.into());
    }
    tracing::debug!(dst = %dst_dir.display(), files = extracted.len(), "archive extracted");
    Ok(extracted)
}

fn unpack_entries(src_archive: &Path, tmp: &Path, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
    let extract_err = |err: io::Error| StoreError::Extract {
        reason: err.to_string(),
    };

    let file = File::open(src_archive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut extracted = Vec::new();

    for entry in archive.entries().map_err(extract_err)? {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut entry = entry.map_err(extract_err)?;
        let raw_path = entry.path().map_err(extract_err)?.into_owned();
        let clean = normalize_entry_path(&raw_path)?;
        let target = tmp.join(&clean);

        match entry.header().entry_type() {
            EntryType::Directory => {
                if clean.as_os_str().is_empty() {
                    continue;
                }
                fs::create_dir_all(&target).map_err(extract_err)?;
                set_mode(&target, entry_mode(&entry)? | 0o755).map_err(extract_err)?;
            }
            EntryType::Regular => {
                if clean.as_os_str().is_empty() {
                    return Err(StoreError::Extract {
                        reason: "regular file entry with empty name".into(),
                    });
                }
                if let Some(dir) = target.parent() {
                    fs::create_dir_all(dir).map_err(extract_err)?;
                }
                write_file_atomic(&mut entry, &target).map_err(extract_err)?;
                set_mode(&target, entry_mode(&entry)? | 0o644).map_err(extract_err)?;
                extracted.push(clean);
            }
            EntryType::Symlink => {
                let link_target = entry
                    .link_name()
                    .map_err(extract_err)?
                    .ok_or_else(|| StoreError::Extract {
                        reason: format!("symlink `{}` has no target", raw_path.display()),
                    })?
                    .into_owned();
                check_symlink_target(&clean, &link_target)?;
                if let Some(dir) = target.parent() {
                    fs::create_dir_all(dir).map_err(extract_err)?;
                }
                make_symlink(&link_target, &target).map_err(extract_err)?;
                extracted.push(clean);
            }
            // Hardlinks, devices, FIFOs, extended headers, sparse files:
            // skipped without error.
            _ => {}
        }
    }

    Ok(extracted)
}

/// Lexically normalize a tar entry name.
///
/// `./` components collapse, `..` resolves against what came before it, and
/// anything that would step outside the extraction root (absolute paths, a
/// leading or surviving `..`) is a traversal error.
fn normalize_entry_path(raw: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(StoreError::PathTraversal(raw.display().to_string()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(StoreError::PathTraversal(raw.display().to_string()));
                }
            }
            Component::Normal(part) => clean.push(part),
        }
    }
    Ok(clean)
}

/// Reject symlink targets that resolve outside the extraction root.
///
/// Resolution is purely lexical, relative to the entry's own directory; the
/// link itself is later created verbatim.
fn check_symlink_target(entry_path: &Path, link_target: &Path) -> Result<()> {
    if link_target.is_absolute() {
        return Err(StoreError::PathTraversal(
            link_target.display().to_string(),
        ));
    }
    let base = entry_path.parent().unwrap_or_else(|| Path::new(""));
    normalize_entry_path(&base.join(link_target))?;
    Ok(())
}

fn write_file_atomic(reader: &mut impl Read, target: &Path) -> io::Result<()> {
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = target.with_file_name(format!("{file_name}.tmp"));
    let mut out = File::create(&staging)?;
    if let Err(err) = io::copy(reader, &mut out) {
        drop(out);
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    drop(out);
    fs::rename(&staging, target)
}

fn entry_mode(entry: &tar::Entry<'_, impl Read>) -> Result<u32> {
    entry
        .header()
        .mode()
        .map(|mode| mode & 0o777)
        .map_err(|err| StoreError::Extract {
            reason: format!("unreadable mode field: {err}"),
        })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if link.exists() || fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    // Symlink entries are skipped on platforms without them.
    Ok(())
}

/// Add the execute bits to an existing file. Idempotent.
pub fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(path)?;
        let mut perms = metadata.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn tar_gz(build: impl FnOnce(&mut tar::Builder<GzEncoder<Vec<u8>>>)) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        build(&mut builder);
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn add_file(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, name: &str, content: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
    }

    fn add_raw_named(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, name: &[u8], content: &[u8]) {
        // Writes the name bytes directly so traversal names survive the
        // builder's own path checks.
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, content).unwrap();
    }

    fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("artifact.tgz");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn detects_gzip_and_raw_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("a.gz");
        fs::write(&gz, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        assert_eq!(detect_format(&gz).unwrap(), ArtifactFormat::TarGz);

        let raw = dir.path().join("b.bin");
        fs::write(&raw, b"#!/bin/sh\n").unwrap();
        assert_eq!(detect_format(&raw).unwrap(), ArtifactFormat::RawBinary);

        let one = dir.path().join("c.bin");
        fs::write(&one, [0x1f]).unwrap();
        assert_eq!(detect_format(&one).unwrap(), ArtifactFormat::RawBinary);

        let empty = dir.path().join("d.bin");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            detect_format(&empty),
            Err(StoreError::FormatDetect)
        ));
    }

    #[test]
    fn extracts_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| {
            add_file(builder, "plugin", b"#!/bin/sh\necho hello\n");
            add_file(builder, "docs/README.md", b"docs\n");
        });
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("extracted/ab/full");

        let listed = extract(&archive, &dst, &CancelToken::new()).unwrap();
        assert_eq!(
            listed,
            vec![PathBuf::from("plugin"), PathBuf::from("docs/README.md")]
        );
        assert_eq!(
            fs::read(dst.join("plugin")).unwrap(),
            b"#!/bin/sh\necho hello\n"
        );
        assert!(dst.join("docs").is_dir());
        // Only files and symlinks are listed, never directories.
        assert!(listed.iter().all(|p| !dst.join(p).is_dir()));
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| {
            add_raw_named(builder, b"../escape.txt", b"hello");
        });
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("out/dir");

        assert!(matches!(
            extract(&archive, &dst, &CancelToken::new()),
            Err(StoreError::PathTraversal(_))
        ));
        assert!(!dst.exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn rejects_nested_traversal_that_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| {
            add_raw_named(builder, b"a/../../b.txt", b"x");
        });
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("out");
        assert!(matches!(
            extract(&archive, &dst, &CancelToken::new()),
            Err(StoreError::PathTraversal(_))
        ));
        assert!(!dst.exists());
    }

    #[test]
    fn interior_dotdot_that_stays_inside_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| {
            add_raw_named(builder, b"a/../b.txt", b"ok");
        });
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("out");
        let listed = extract(&archive, &dst, &CancelToken::new()).unwrap();
        assert_eq!(listed, vec![PathBuf::from("b.txt")]);
        assert_eq!(fs::read(dst.join("b.txt")).unwrap(), b"ok");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_tree_is_created_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| {
            add_file(builder, "bin/plugin", b"payload");
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o777);
            header.set_entry_type(EntryType::Symlink);
            header.set_cksum();
            builder
                .append_link(&mut header, "bin/plugin-latest", "plugin")
                .unwrap();
        });
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("out");

        let listed = extract(&archive, &dst, &CancelToken::new()).unwrap();
        assert!(listed.contains(&PathBuf::from("bin/plugin-latest")));
        let link = fs::read_link(dst.join("bin/plugin-latest")).unwrap();
        assert_eq!(link, PathBuf::from("plugin"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_tree_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| {
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o777);
            header.set_entry_type(EntryType::Symlink);
            header.set_cksum();
            builder
                .append_link(&mut header, "evil", "../../etc/passwd")
                .unwrap();
        });
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("out");
        assert!(matches!(
            extract(&archive, &dst, &CancelToken::new()),
            Err(StoreError::PathTraversal(_))
        ));
        assert!(!dst.exists());
    }

    #[test]
    fn skips_unsupported_entry_types() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| {
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Fifo);
            header.set_cksum();
            builder.append_data(&mut header, "pipe", &b""[..]).unwrap();
            add_file(builder, "real", b"data");
        });
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("out");
        let listed = extract(&archive, &dst, &CancelToken::new()).unwrap();
        assert_eq!(listed, vec![PathBuf::from("real")]);
        assert!(!dst.join("pipe").exists());
    }

    #[test]
    fn corrupt_gzip_is_an_extract_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.tgz");
        fs::write(&archive, [0x1f, 0x8b, 0xFF, 0xFF, 0x00]).unwrap();
        let dst = dir.path().join("out");
        assert!(matches!(
            extract(&archive, &dst, &CancelToken::new()),
            Err(StoreError::Extract { .. })
        ));
        assert!(!dst.exists());
    }

    #[test]
    fn cancelled_token_aborts_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_gz(|builder| add_file(builder, "plugin", b"data"));
        let archive = write_archive(dir.path(), &bytes);
        let dst = dir.path().join("out");

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            extract(&archive, &dst, &token),
            Err(StoreError::Cancelled)
        ));
        assert!(!dst.exists());
        // The temp tree is cleaned up, not left behind.
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".extract-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn replaces_an_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("stale"), b"old").unwrap();

        let bytes = tar_gz(|builder| add_file(builder, "fresh", b"new"));
        let archive = write_archive(dir.path(), &bytes);
        extract(&archive, &dst, &CancelToken::new()).unwrap();
        assert!(!dst.join("stale").exists());
        assert_eq!(fs::read(dst.join("fresh")).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn set_executable_is_idempotent() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        set_executable(&path).unwrap();
        set_executable(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
