//! Archive layers: safe extraction and directory packing.
//!
//! Layers are gzip-compressed tarballs from untrusted registries. Every
//! entry path is cleaned lexically and rejected if it would land outside
//! the destination. Symlinks whose targets escape are rejected the same way.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tempfile::NamedTempFile;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::{Error, Result};

/// Clean an archive entry path lexically.
///
/// Root and prefix components are dropped so absolute names re-root under
/// the destination. Returns `None` when a `..` would climb above the root.
#[must_use]
pub fn clean_entry_path(raw: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in raw.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part),
        }
    }
    Some(parts.iter().collect())
}

/// Extract a gzip-compressed tarball into `dest`.
///
/// Returns the paths of created files, directories and symlinks. Entry
/// types other than those three are skipped.
pub fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest).map_err(|e| Error::io(e, dest, "create"))?;
    let root = dest
        .canonicalize()
        .map_err(|e| Error::io(e, dest, "canonicalize"))?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| Error::extraction_failed(dest, e.to_string()))?;

    let mut extracted = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::extraction_failed(dest, e.to_string()))?;
        let raw = entry
            .path()
            .map_err(|e| Error::extraction_failed(dest, e.to_string()))?
            .into_owned();

        let Some(relative) = clean_entry_path(&raw) else {
            return Err(Error::PathTraversal {
                entry: raw.display().to_string(),
            });
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                prepare_parent(&root, &target, &raw)?;
                std::fs::create_dir_all(&target).map_err(|e| Error::io(e, &target, "create"))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                prepare_parent(&root, &target, &raw)?;
                remove_symlink(&target)?;
                let mut file = File::create(&target).map_err(|e| Error::io(e, &target, "create"))?;
                std::io::copy(&mut entry, &mut file)
                    .map_err(|e| Error::extraction_failed(dest, format!("{}: {e}", raw.display())))?;

                #[cfg(unix)]
                if let Ok(mode) = entry.header().mode() {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))
                        .map_err(|e| Error::io(e, &target, "chmod"))?;
                }
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| Error::extraction_failed(dest, e.to_string()))?
                    .ok_or_else(|| {
                        Error::extraction_failed(dest, format!("symlink {} has no target", raw.display()))
                    })?
                    .into_owned();
                if !symlink_stays_inside(&relative, &link) {
                    return Err(Error::PathTraversal {
                        entry: format!("{} -> {}", raw.display(), link.display()),
                    });
                }
                prepare_parent(&root, &target, &raw)?;
                remove_symlink(&target)?;
                create_symlink(&link, &target)?;
            }
            other => {
                trace!(entry = %raw.display(), ?other, "Skipping unsupported archive entry");
                continue;
            }
        }

        trace!(entry = %raw.display(), path = %target.display(), "Extracted entry");
        extracted.push(target);
    }

    debug!(dest = %dest.display(), count = extracted.len(), "Extracted archive");
    Ok(extracted)
}

/// Whether a relative symlink target resolves inside the extraction root.
fn symlink_stays_inside(entry: &Path, link: &Path) -> bool {
    if link.has_root() {
        return false;
    }
    let base = entry.parent().unwrap_or_else(|| Path::new(""));
    let mut depth: usize = 0;
    for component in base.join(link).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir => return false,
        }
    }
    true
}

/// Create the parent directory and check it resolves inside `root`.
///
/// Catches writes routed outside through previously extracted symlinks.
fn prepare_parent(root: &Path, target: &Path, raw: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create"))?;
        ensure_inside(root, parent, raw)?;
    }
    Ok(())
}

fn ensure_inside(root: &Path, path: &Path, raw: &Path) -> Result<()> {
    let resolved = path
        .canonicalize()
        .map_err(|e| Error::io(e, path, "canonicalize"))?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(Error::PathTraversal {
            entry: raw.display().to_string(),
        })
    }
}

fn remove_symlink(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink()) {
        std::fs::remove_file(path).map_err(|e| Error::io(e, path, "remove"))?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).map_err(|e| Error::io(e, target, "symlink"))
}

#[cfg(not(unix))]
fn create_symlink(link: &Path, target: &Path) -> Result<()> {
    trace!(link = %link.display(), path = %target.display(), "Symlinks unsupported, skipping");
    Ok(())
}

/// Pack a directory into a temporary `.tar.gz` file.
///
/// Paths are stored relative to `source`. Symlinks are stored as links, not
/// followed. The file is deleted when the returned handle is dropped.
pub fn archive_directory(source: &Path) -> Result<NamedTempFile> {
    let temp = tempfile::Builder::new()
        .prefix("porter-archive-")
        .suffix(".tar.gz")
        .tempfile()
        .map_err(|e| Error::io(e, std::env::temp_dir(), "create"))?;
    let file = temp
        .reopen()
        .map_err(|e| Error::io(e, temp.path(), "open"))?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut count = 0usize;
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::io(e.into(), source, "walk"))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::invalid_input(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        builder
            .append_path_with_name(entry.path(), relative)
            .map_err(|e| Error::io(e, entry.path(), "archive"))?;
        count += 1;
    }

    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(|e| Error::io(e, temp.path(), "write"))?;

    debug!(source = %source.display(), archive = %temp.path().display(), entries = count, "Packed directory");
    Ok(temp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        for (path, content) in entries {
            let mut header = Header::new_gnu();
            // set_path refuses `..`, so write the raw name bytes.
            let name = &mut header.as_old_mut().name;
            name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_entry_type(EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn symlink_tarball(name: &str, target: &str) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        let old = header.as_old_mut();
        old.name[..name.len()].copy_from_slice(name.as_bytes());
        old.linkname[..target.len()].copy_from_slice(target.as_bytes());
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_clean_entry_path() {
        assert_eq!(clean_entry_path(Path::new("a/./b")), Some(PathBuf::from("a/b")));
        assert_eq!(clean_entry_path(Path::new("/abs/file")), Some(PathBuf::from("abs/file")));
        assert_eq!(clean_entry_path(Path::new("a/../b")), Some(PathBuf::from("b")));
        assert_eq!(clean_entry_path(Path::new("../../etc/passwd")), None);
        assert_eq!(clean_entry_path(Path::new("a/../../x")), None);
    }

    #[test]
    fn test_extract_files() -> Result<()> {
        let temp = TempDir::new()?;
        let dest = temp.path().join("out");
        let data = tarball(&[("bin/tool", b"binary"), ("README", b"docs")]);

        let paths = extract_tar_gz(&data[..], &dest)?;
        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::read(dest.join("bin/tool"))?, b"binary");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dest.join("bin/tool"))?.permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        Ok(())
    }

    #[test]
    fn test_extract_rejects_traversal() -> Result<()> {
        let temp = TempDir::new()?;
        let dest = temp.path().join("a").join("b").join("out");
        let data = tarball(&[("../../etc/passwd", b"root:x:0:0")]);

        let err = extract_tar_gz(&data[..], &dest).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
        assert!(!temp.path().join("a").join("etc").exists());
        Ok(())
    }

    #[test]
    fn test_extract_reroots_absolute_names() -> Result<()> {
        let temp = TempDir::new()?;
        let dest = temp.path().join("out");
        let data = tarball(&[("/usr/bin/tool", b"x")]);

        extract_tar_gz(&data[..], &dest)?;
        assert!(dest.join("usr/bin/tool").is_file());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_symlinks() -> Result<()> {
        let temp = TempDir::new()?;
        let dest = temp.path().join("out");

        extract_tar_gz(&symlink_tarball("bin/current", "../lib/tool")[..], &dest)?;
        assert_eq!(
            std::fs::read_link(dest.join("bin/current"))?,
            PathBuf::from("../lib/tool")
        );

        let err = extract_tar_gz(&symlink_tarball("escape", "../../outside")[..], &dest).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));

        let err = extract_tar_gz(&symlink_tarball("abs", "/etc/passwd")[..], &dest).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
        Ok(())
    }

    #[test]
    fn test_archive_directory_round_trip() -> Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("src");
        std::fs::create_dir_all(source.join("nested"))?;
        std::fs::write(source.join("top.txt"), b"top")?;
        std::fs::write(source.join("nested/inner.txt"), b"inner")?;
        #[cfg(unix)]
        std::os::unix::fs::symlink("top.txt", source.join("link"))?;

        let archive = archive_directory(&source)?;
        let name = archive.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("porter-archive-"));
        assert!(name.ends_with(".tar.gz"));

        let dest = temp.path().join("dest");
        extract_tar_gz(File::open(archive.path())?, &dest)?;
        assert_eq!(std::fs::read(dest.join("top.txt"))?, b"top");
        assert_eq!(std::fs::read(dest.join("nested/inner.txt"))?, b"inner");
        #[cfg(unix)]
        assert_eq!(std::fs::read_link(dest.join("link"))?, PathBuf::from("top.txt"));
        Ok(())
    }
}
