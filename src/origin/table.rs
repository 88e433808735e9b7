use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::SystemTime;

use bytes::Bytes;
use http::HeaderMap;

use super::append::PendingUpload;
use super::name::{self, EndpointKind};
use super::notify::NotifySpec;
use super::scanner::{Access, Segment};

/// Which write methods an endpoint exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub truncate: bool,
    pub append: bool,
}

impl WriteSet {
    pub fn any(self) -> bool {
        self.truncate || self.append
    }
}

/// One in-memory content generation of a file plus everything needed to
/// serve and mutate it.
#[derive(Debug)]
pub struct FileEntry {
    pub contents: Bytes,
    pub size: u64,
    pub path: PathBuf,
    pub headers: HeaderMap,
    pub mtime_i: (SystemTime, u32),
    pub access: Access,
    pub toggle: bool,
    pub notify: Vec<NotifySpec>,
    pub write: WriteSet,
    pub write_appends: BTreeMap<String, PendingUpload>,
    pub redirect: Option<String>,
    pub segment: Segment,
}

impl FileEntry {
    pub fn set_contents(&mut self, contents: Bytes) {
        self.size = contents.len() as u64;
        self.contents = contents;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub filename: String,
    pub kind: EndpointKind,
}

/// The endpoint-name table: an ordered map from subscription suffix to
/// (filename, method), so prefix folds are range scans, next to the file
/// records themselves. Mutations report which suffixes appeared or
/// vanished; the owner pairs those with framework subscribe/unsubscribe.
#[derive(Debug, Default)]
pub struct FileTable {
    names: BTreeMap<String, Endpoint>,
    files: HashMap<String, FileEntry>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, filename: &str) -> Option<&FileEntry> {
        self.files.get(filename)
    }

    pub fn get_mut(&mut self, filename: &str) -> Option<&mut FileEntry> {
        self.files.get_mut(filename)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn filenames(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }

    pub fn lookup(&self, suffix: &str) -> Option<&Endpoint> {
        self.names.get(suffix)
    }

    /// Stores (or replaces) a record and reconciles its endpoint names.
    /// Returns the suffixes to subscribe.
    pub fn insert(&mut self, filename: String, entry: FileEntry, use_suffix: bool) -> Vec<String> {
        self.files.insert(filename.clone(), entry);
        let (added, _removed) = self.sync_endpoints(&filename, use_suffix);
        added
    }

    /// Recomputes the endpoint set a record should expose (after a write
    /// capability or redirect change) and applies the difference. Returns
    /// (subscribe, unsubscribe) suffix lists.
    pub fn sync_endpoints(&mut self, filename: &str, use_suffix: bool) -> (Vec<String>, Vec<String>) {
        let desired = match self.files.get(filename) {
            Some(entry) => desired_endpoints(filename, entry.write, use_suffix),
            None => Vec::new(),
        };

        let mut added = Vec::new();
        for (suffix, kind) in &desired {
            let endpoint = Endpoint {
                filename: filename.to_string(),
                kind: *kind,
            };
            if self.names.get(suffix).is_none_or(|existing| *existing != endpoint) {
                self.names.insert(suffix.clone(), endpoint);
                added.push(suffix.clone());
            }
        }

        let removed: Vec<String> = self
            .names
            .iter()
            .filter(|(suffix, endpoint)| {
                endpoint.filename == filename
                    && !desired.iter().any(|(name, _)| name == *suffix)
            })
            .map(|(suffix, _)| suffix.clone())
            .collect();
        for suffix in &removed {
            self.names.remove(suffix);
        }
        added.sort();
        (added, removed)
    }

    /// Drops a record and all of its endpoint names. Returns the suffixes
    /// to unsubscribe.
    pub fn remove(&mut self, filename: &str) -> (Option<FileEntry>, Vec<String>) {
        let entry = self.files.remove(filename);
        let removed: Vec<String> = self
            .names
            .iter()
            .filter(|(_, endpoint)| endpoint.filename == filename)
            .map(|(suffix, _)| suffix.clone())
            .collect();
        for suffix in &removed {
            self.names.remove(suffix);
        }
        (entry, removed)
    }

    /// The method tags subscribed under the same stem as `suffix`
    /// (`<stem><method>`), restricted to endpoints of the same file: the
    /// `Allow` list for OPTIONS.
    pub fn method_tags(&self, suffix: &str, filename: &str) -> Vec<String> {
        let stem = match suffix.rfind('/') {
            Some(pos) => &suffix[..pos + 1],
            None => "",
        };
        self.names
            .range(stem.to_string()..)
            .take_while(|(name, _)| name.starts_with(stem))
            .filter(|(name, endpoint)| {
                endpoint.filename == filename && !name[stem.len()..].contains('/')
            })
            .map(|(_, endpoint)| endpoint.kind.tag().to_string())
            .collect()
    }
}

fn desired_endpoints(
    filename: &str,
    write: WriteSet,
    use_suffix: bool,
) -> Vec<(String, EndpointKind)> {
    if !use_suffix {
        return vec![(
            name::endpoint_name(filename, EndpointKind::Bare),
            EndpointKind::Bare,
        )];
    }

    let mut kinds: Vec<EndpointKind> = EndpointKind::READS.to_vec();
    if write.truncate {
        kinds.push(EndpointKind::Put);
    }
    if write.append {
        kinds.push(EndpointKind::Post);
    }

    let mut endpoints = Vec::with_capacity(kinds.len() * 2);
    for kind in &kinds {
        endpoints.push((name::endpoint_name(filename, *kind), *kind));
    }
    if let Some(alias) = name::index_alias(filename) {
        for kind in &kinds {
            endpoints.push((name::endpoint_name(&alias, *kind), *kind));
        }
    }
    endpoints
}
