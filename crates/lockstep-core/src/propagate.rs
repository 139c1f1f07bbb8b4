//! Local propagation of build output into dependents.
//!
//! Copies a package's distributable surface into
//! `<root>/<dependent>/<dependency_dir>/<key>` so the dependent resolves it
//! as if it had been fetched from the registry.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::manifest::{package_dir, MANIFEST_FILE};
use crate::package::PackageId;

/// Whether a `files` entry is copied as a single file.
///
/// An entry is treated as a file iff it contains a `.`. A directory named
/// `a.b` is therefore copied as a file (and fails).
pub fn looks_like_file(entry: &str) -> bool {
    entry.contains('.')
}

/// Where `key` lands inside `dependent`'s dependency directory.
pub fn propagation_target(
    root: &Path,
    dependent: &PackageId,
    dependency_dir: &str,
    key: &str,
) -> PathBuf {
    package_dir(root, dependent).join(dependency_dir).join(key)
}

/// Copy a package into a dependent's dependency directory.
///
/// `files` of `None` copies the whole tree except the package's own
/// `dependency_dir`; otherwise the manifest plus each listed entry.
pub fn propagate(
    source: &Path,
    target: &Path,
    files: Option<&[String]>,
    dependency_dir: &str,
) -> io::Result<u64> {
    match files {
        None => copy_tree_excluding(source, target, &[dependency_dir]),
        Some(entries) => copy_listed(source, target, entries),
    }
}

/// Recursively merge `source` into `target`, overwriting files.
///
/// Returns the number of files and links written.
pub fn copy_tree(source: &Path, target: &Path) -> io::Result<u64> {
    copy_tree_excluding(source, target, &[])
}

/// [`copy_tree`], skipping top-level entries of `source` named in `skip`.
///
/// Leaving out the source's dependency directory keeps copies flat: a
/// package that already holds a copy of its dependent (a broken cycle)
/// does not carry it back on the next run.
pub fn copy_tree_excluding(source: &Path, target: &Path, skip: &[&str]) -> io::Result<u64> {
    fs::create_dir_all(target)?;
    let mut written = 0;

    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1
                || !e
                    .file_name()
                    .to_str()
                    .is_some_and(|name| skip.iter().any(|s| *s == name))
        });
    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let dest = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
            written += 1;
        } else {
            clear_link(&dest)?;
            fs::copy(entry.path(), &dest)?;
            written += 1;
        }
    }

    debug!(source = %source.display(), target = %target.display(), files = written, "Copied tree");
    Ok(written)
}

/// Copy `package.json` plus each entry of `files`.
pub fn copy_listed(source: &Path, target: &Path, files: &[String]) -> io::Result<u64> {
    fs::create_dir_all(target)?;
    let mut written = 0;

    let entries = std::iter::once(MANIFEST_FILE).chain(files.iter().map(String::as_str));
    for entry in entries {
        if !is_contained(entry) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("files entry '{entry}' leaves the package directory"),
            ));
        }
        let from = source.join(entry);
        let to = target.join(entry);
        if looks_like_file(entry) {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            clear_link(&to)?;
            fs::copy(&from, &to).map_err(|e| annotate(e, &from))?;
            written += 1;
        } else {
            if !from.is_dir() {
                return Err(annotate(
                    io::Error::new(io::ErrorKind::NotFound, "listed directory is missing"),
                    &from,
                ));
            }
            written += copy_tree(&from, &to)?;
        }
    }

    Ok(written)
}

/// Only plain relative segments; no root, prefix, `.` or `..`.
fn is_contained(entry: &str) -> bool {
    let path = Path::new(entry);
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn annotate(err: io::Error, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {err}", path.display()))
}

/// Remove `path` if it is a symlink so a copy writes a real file.
fn clear_link(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(path),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn copy_symlink(link: &Path, dest: &Path) -> io::Result<()> {
    let pointee = fs::read_link(link)?;
    if let Ok(meta) = fs::symlink_metadata(dest) {
        if meta.is_dir() {
            fs::remove_dir_all(dest)?;
        } else {
            fs::remove_file(dest)?;
        }
    }
    std::os::unix::fs::symlink(pointee, dest)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, dest: &Path) -> io::Result<()> {
    if link.is_dir() {
        copy_tree(link, dest).map(|_| ())
    } else {
        fs::copy(link, dest).map(|_| ())
    }
}
