//! Conditional recursive upload

use crate::{Result, SshManager};
use fleetssh_ssh::{remote_join, Endpoint};
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

impl SshManager {
    /// Upload `source` to `target`, copying only files whose local path matches `pattern`.
    ///
    /// `pattern` is anchored at the start of the path, so `.*\.conf$` selects
    /// `.conf` files while `\.conf$` selects nothing. Every local directory is
    /// mirrored remotely whether or not it holds a matching file. If `target`
    /// is an existing remote directory, the tree lands in
    /// `target/<basename(source)>`, or straight in `target` when `source`
    /// ends with a separator. With `clean_target` that destination is wiped
    /// and recreated first, even if nothing ends up matching.
    ///
    /// Returns the number of files uploaded.
    pub async fn cond_upload(
        &self,
        endpoint: &Endpoint,
        source: &Path,
        target: &str,
        pattern: &str,
        clean_target: bool,
        sudo: Option<bool>,
    ) -> Result<usize> {
        let matcher = compile_pattern(pattern)?;

        let mut target = target.to_string();
        if self.is_dir(endpoint, &target).await? {
            let name = basename(source);
            if !name.is_empty() {
                target = remote_join(&target, &name);
            }
        }

        if clean_target {
            self.remove_recursive(endpoint, &target, sudo).await?;
            self.make_dir(endpoint, &target, sudo).await?;
        }

        let source = expand_home(source);
        if !tokio::fs::metadata(&source).await?.is_dir() {
            let local = source.to_string_lossy();
            if !matcher.is_match(&local) {
                debug!("Pattern '{}' doesn't match the file '{}', uploading skipped", pattern, local);
                return Ok(0);
            }
            self.upload(endpoint, &source, &target, sudo).await?;
            debug!("File '{}' uploaded to the remote folder '{}'", local, target);
            return Ok(1);
        }

        let mut uploaded = 0;
        let mut pending = VecDeque::from([source.clone()]);

        while let Some(dir) = pending.pop_front() {
            let target_dir = remote_dir(&target, dir.strip_prefix(&source).unwrap_or(Path::new("")));
            self.make_dir(endpoint, &target_dir, sudo).await?;

            let (subdirs, files) = list_dir(&dir).await?;
            for file in files {
                let local = file.to_string_lossy();
                let name = file.file_name().unwrap_or_default().to_string_lossy();
                let remote = remote_join(&target_dir, &name);

                if matcher.is_match(&local) {
                    self.upload(endpoint, &file, &remote, sudo).await?;
                    debug!("File '{}' uploaded to '{}'", local, remote);
                    uploaded += 1;
                } else {
                    debug!("Pattern '{}' doesn't match the file '{}', uploading skipped", pattern, local);
                }
            }
            pending.extend(subdirs);
        }

        debug!("Uploaded {} files from {} to {}:{}", uploaded, source.display(), endpoint, target);
        Ok(uploaded)
    }
}

/// Compile `pattern` so it only matches at the start of the input
pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{})", pattern))?)
}

/// Last component of `path` as written; empty when it ends with a separator
pub(crate) fn basename(path: &Path) -> String {
    let text = path.to_string_lossy();
    if text.ends_with('/') || text.ends_with(std::path::MAIN_SEPARATOR) {
        return String::new();
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Replace a leading `~` with the local home directory
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Remote directory mirroring local `relative` below `target`, always `/`-separated
pub(crate) fn remote_dir(target: &str, relative: &Path) -> String {
    let mut joined = target.to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            joined.push('/');
            joined.push_str(&part.to_string_lossy().replace('\\', "/"));
        }
    }
    normalize_remote(&joined)
}

/// Collapse empty, `.` and `..` segments of a POSIX path
pub(crate) fn normalize_remote(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Subdirectories and files of `dir`, each sorted by name.
///
/// Symlinked directories are listed as neither and never descended into.
async fn list_dir(dir: &Path) -> std::io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut subdirs = Vec::new();
    let mut files = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;

        if file_type.is_dir() {
            subdirs.push(path);
        } else if file_type.is_symlink() {
            if !tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                files.push(path);
            }
        } else {
            files.push(path);
        }
    }

    subdirs.sort();
    files.sort();
    Ok((subdirs, files))
}
