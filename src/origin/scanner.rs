use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use super::pattern;
use super::replace::INDEX_PREFIX;

/// Filesystem access mode of a scanned file, from the owner permission
/// bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    None,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// One read-allowlist entry: a logical name plus an optional byte window.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadSpec {
    pub name: String,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub offset: Option<i64>,
    pub length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub name: String,
    pub mtime: SystemTime,
    pub access: Access,
    pub size: u64,
    pub segment: Segment,
}

/// Enumerates the files a refresh should consider. Without an allowlist
/// this walks the whole root recursively; with one, only the listed names
/// are surfaced, each restricted to its byte segment. Unreadable or
/// non-regular entries never abort the scan.
pub fn scan(root: &Path, allowlist: Option<&[ReadSpec]>) -> Result<Vec<ScannedFile>> {
    let mut files = match allowlist {
        Some(specs) => scan_allowlist(root, specs),
        None => {
            let mut files = Vec::new();
            scan_dir(root, root, &mut files)
                .with_context(|| format!("failed to scan directory {}", root.display()))?;
            files
        }
    };
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn scan_allowlist(root: &Path, specs: &[ReadSpec]) -> Vec<ScannedFile> {
    let mut files = Vec::new();
    for spec in specs {
        if pattern::is_pattern(&spec.name) {
            warn!(name = %spec.name, "read target contains a wildcard; skipped");
            continue;
        }
        let path = root.join(&spec.name);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "read target unavailable; skipped");
                continue;
            }
        };
        if !metadata.is_file() {
            warn!(path = %path.display(), "read target is not a regular file; skipped");
            continue;
        }
        match scanned_file(path, spec.name.clone(), &metadata) {
            Some(mut file) => {
                file.segment = Segment {
                    offset: spec.offset,
                    length: spec.length,
                };
                files.push(file);
            }
            None => continue,
        }
    }
    files
}

fn scan_dir(root: &Path, dir: &Path, files: &mut Vec<ScannedFile>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // The root must be enumerable; deeper failures only cost their
        // subtree.
        Err(err) if dir != root => {
            warn!(path = %dir.display(), error = %err, "unreadable directory skipped");
            return Ok(());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read directory {}", dir.display()));
        }
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unstattable entry skipped");
                continue;
            }
        };
        if file_type.is_dir() {
            scan_dir(root, &path, files)?;
            continue;
        }
        if !file_type.is_file() {
            warn!(path = %path.display(), "non-regular file skipped");
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            warn!(path = %path.display(), "non-UTF-8 filename skipped");
            continue;
        };
        if file_name.starts_with(INDEX_PREFIX) {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let Some(name) = relative.to_str().map(|name| name.replace('\\', "/")) else {
            warn!(path = %path.display(), "non-UTF-8 filename skipped");
            continue;
        };
        if pattern::is_pattern(&name) {
            warn!(name, "filename contains a subscription metacharacter; skipped");
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unstattable file skipped");
                continue;
            }
        };
        if let Some(file) = scanned_file(path, name, &metadata) {
            files.push(file);
        }
    }
    Ok(())
}

fn scanned_file(path: PathBuf, name: String, metadata: &fs::Metadata) -> Option<ScannedFile> {
    let mtime = match metadata.modified() {
        Ok(mtime) => mtime,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "file without mtime skipped");
            return None;
        }
    };
    Some(ScannedFile {
        path,
        name,
        mtime,
        access: access_mode(metadata),
        size: metadata.len(),
        segment: Segment::default(),
    })
}

#[cfg(unix)]
pub fn access_mode(metadata: &fs::Metadata) -> Access {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode();
    match (mode & 0o400 != 0, mode & 0o200 != 0) {
        (true, true) => Access::ReadWrite,
        (true, false) => Access::Read,
        (false, true) => Access::Write,
        (false, false) => Access::None,
    }
}

#[cfg(not(unix))]
pub fn access_mode(metadata: &fs::Metadata) -> Access {
    if metadata.permissions().readonly() {
        Access::Read
    } else {
        Access::ReadWrite
    }
}

/// Restricts loaded contents to the configured byte window. A negative
/// offset counts back from EOF; a missing length runs to EOF.
pub fn apply_segment(data: Vec<u8>, segment: Segment) -> Vec<u8> {
    let len = data.len();
    let start = match segment.offset {
        None => 0,
        Some(offset) if offset < 0 => len.saturating_sub(offset.unsigned_abs() as usize),
        Some(offset) => (offset as usize).min(len),
    };
    let end = match segment.length {
        None => len,
        Some(length) => start.saturating_add(length as usize).min(len),
    };
    if start == 0 && end == len {
        return data;
    }
    data[start..end].to_vec()
}
