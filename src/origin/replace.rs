use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reserved sidecar name prefix; the scanner skips anything carrying it.
pub const INDEX_PREFIX: &str = ".shelf-index";

pub fn index_path(root: &Path, process_index: u32) -> PathBuf {
    root.join(format!("{INDEX_PREFIX}.{process_index}"))
}

/// Which replacement algorithm the origin runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    Lfuda,
    LfudaGdsf,
    Lru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LfudaEntry {
    key: u64,
    hits: u64,
}

/// Replacement state. LFUDA keeps a priority key and hit count per file
/// and a global age that ratchets up to the key of every removed file, so
/// long-lived residents must keep earning hits to stay ahead of new
/// admissions. LRU keeps a monotonic microsecond stamp per file.
#[derive(Debug)]
pub enum Replacement {
    Lfuda {
        gdsf: bool,
        age: u64,
        entries: HashMap<String, LfudaEntry>,
    },
    Lru {
        start: Instant,
        base: u64,
        entries: HashMap<String, u64>,
    },
}

/// Sidecar payload: the replacement type tags a list of per-file values.
/// LFUDA stores `key - age` so the keys can be rebased on reload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PersistedIndex {
    Lfuda(Vec<(String, (u64, u64))>),
    LfudaGdsf(Vec<(String, (u64, u64))>),
    Lru(Vec<(String, u64)>),
}

impl Replacement {
    pub fn new(mode: ReplaceMode) -> Self {
        match mode {
            ReplaceMode::Lfuda => Replacement::Lfuda {
                gdsf: false,
                age: 0,
                entries: HashMap::new(),
            },
            ReplaceMode::LfudaGdsf => Replacement::Lfuda {
                gdsf: true,
                age: 0,
                entries: HashMap::new(),
            },
            ReplaceMode::Lru => Replacement::Lru {
                start: Instant::now(),
                base: 0,
                entries: HashMap::new(),
            },
        }
    }

    pub fn mode(&self) -> ReplaceMode {
        match self {
            Replacement::Lfuda { gdsf: false, .. } => ReplaceMode::Lfuda,
            Replacement::Lfuda { gdsf: true, .. } => ReplaceMode::LfudaGdsf,
            Replacement::Lru { .. } => ReplaceMode::Lru,
        }
    }

    /// Registers a file on first admission: LFUDA priority defaults to the
    /// current age with zero hits, LRU stamps the admission time.
    pub fn on_admit(&mut self, name: &str) {
        match self {
            Replacement::Lfuda { age, entries, .. } => {
                entries
                    .entry(name.to_string())
                    .or_insert(LfudaEntry { key: *age, hits: 0 });
            }
            Replacement::Lru { start, base, entries } => {
                let now = lru_now(*start, *base);
                entries.insert(name.to_string(), now);
            }
        }
    }

    /// Updates the priority on a successful response against a file of the
    /// given current size.
    pub fn on_hit(&mut self, name: &str, size: u64) {
        match self {
            Replacement::Lfuda { gdsf, age, entries } => {
                let entry = entries
                    .entry(name.to_string())
                    .or_insert(LfudaEntry { key: *age, hits: 0 });
                entry.hits = entry.hits.saturating_add(1);
                entry.key = if *gdsf {
                    entry.hits / gdsf_denominator(size) + *age
                } else {
                    entry.hits + *age
                };
            }
            Replacement::Lru { start, base, entries } => {
                let now = lru_now(*start, *base);
                entries.insert(name.to_string(), now);
            }
        }
    }

    /// Drops a file from the index. Under LFUDA, removal of a file whose
    /// key exceeds the age raises the age to that key.
    pub fn on_remove(&mut self, name: &str) {
        match self {
            Replacement::Lfuda { age, entries, .. } => {
                if let Some(removed) = entries.remove(name)
                    && removed.key > *age
                {
                    debug!(name, age = removed.key, "replacement age raised");
                    *age = removed.key;
                }
            }
            Replacement::Lru { entries, .. } => {
                entries.remove(name);
            }
        }
    }

    /// The priority key used to order refresh admission; unknown files get
    /// the default a fresh admission would receive.
    pub fn priority(&self, name: &str) -> u64 {
        match self {
            Replacement::Lfuda { age, entries, .. } => {
                entries.get(name).map(|entry| entry.key).unwrap_or(*age)
            }
            Replacement::Lru { base, entries, .. } => {
                entries.get(name).copied().unwrap_or(*base)
            }
        }
    }

    /// Discards index entries for files no longer in the table; removals
    /// by eviction go through `on_remove` instead so the age ratchets.
    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        match self {
            Replacement::Lfuda { entries, .. } => entries.retain(|name, _| keep(name)),
            Replacement::Lru { entries, .. } => entries.retain(|name, _| keep(name)),
        }
    }

    /// Writes the index to its sidecar via a `_tmp` companion plus rename.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let persisted = match self {
            Replacement::Lfuda { gdsf, age, entries } => {
                let items = entries
                    .iter()
                    .map(|(name, entry)| {
                        (name.clone(), (entry.key.saturating_sub(*age), entry.hits))
                    })
                    .collect();
                if *gdsf {
                    PersistedIndex::LfudaGdsf(items)
                } else {
                    PersistedIndex::Lfuda(items)
                }
            }
            Replacement::Lru { entries, .. } => PersistedIndex::Lru(
                entries
                    .iter()
                    .map(|(name, stamp)| (name.clone(), *stamp))
                    .collect(),
            ),
        };

        let data = serde_json::to_vec(&persisted)?;
        let mut temp = path.as_os_str().to_owned();
        temp.push("_tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, data)
            .with_context(|| format!("failed to write replacement index {}", temp.display()))?;
        fs::rename(&temp, path)
            .with_context(|| format!("failed to rename replacement index into {}", path.display()))
    }

    /// Restores the index from its sidecar. A missing file, a malformed
    /// payload, or a type tag that does not match the configured mode is
    /// logged and ignored.
    pub fn restore(&mut self, path: &Path) {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read replacement index");
                return;
            }
        };
        let persisted: PersistedIndex = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "malformed replacement index ignored");
                return;
            }
        };

        match (self, persisted) {
            (Replacement::Lfuda { gdsf: false, age, entries }, PersistedIndex::Lfuda(items))
            | (Replacement::Lfuda { gdsf: true, age, entries }, PersistedIndex::LfudaGdsf(items)) => {
                for (name, (delta, hits)) in items {
                    entries.insert(
                        name,
                        LfudaEntry {
                            key: delta.saturating_add(*age),
                            hits,
                        },
                    );
                }
            }
            (Replacement::Lru { base, entries, .. }, PersistedIndex::Lru(items)) => {
                // Rebase so every restored stamp compares below the next hit.
                let max = items.iter().map(|(_, stamp)| *stamp).max().unwrap_or(0);
                *base = max.saturating_add(1);
                for (name, stamp) in items {
                    entries.insert(name, stamp);
                }
            }
            (current, persisted) => {
                warn!(
                    path = %path.display(),
                    configured = ?current.mode(),
                    stored = persisted.tag(),
                    "replacement index type mismatch ignored"
                );
            }
        }
    }

    #[cfg(test)]
    pub fn age(&self) -> u64 {
        match self {
            Replacement::Lfuda { age, .. } => *age,
            Replacement::Lru { .. } => 0,
        }
    }
}

impl PersistedIndex {
    fn tag(&self) -> &'static str {
        match self {
            PersistedIndex::Lfuda(_) => "lfuda",
            PersistedIndex::LfudaGdsf(_) => "lfuda_gdsf",
            PersistedIndex::Lru(_) => "lru",
        }
    }
}

fn lru_now(start: Instant, base: u64) -> u64 {
    base.saturating_add(start.elapsed().as_micros() as u64)
}

/// Size cost in whole KiB; zero-byte files still cost one so the GDSF
/// division is defined.
fn gdsf_denominator(size: u64) -> u64 {
    size.div_ceil(1024).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lfuda_priority_is_hits_plus_age() {
        let mut replacement = Replacement::new(ReplaceMode::Lfuda);
        replacement.on_admit("a");
        assert_eq!(replacement.priority("a"), 0);
        replacement.on_hit("a", 4096);
        replacement.on_hit("a", 4096);
        assert_eq!(replacement.priority("a"), 2);
    }

    #[test]
    fn removal_raises_age_for_later_admissions() {
        let mut replacement = Replacement::new(ReplaceMode::Lfuda);
        replacement.on_admit("a");
        for _ in 0..5 {
            replacement.on_hit("a", 10);
        }
        replacement.on_remove("a");
        assert_eq!(replacement.age(), 5);
        // New files now default to the raised age.
        assert_eq!(replacement.priority("b"), 5);
        replacement.on_admit("b");
        replacement.on_hit("b", 10);
        assert_eq!(replacement.priority("b"), 6);
    }

    #[test]
    fn age_never_decreases() {
        let mut replacement = Replacement::new(ReplaceMode::Lfuda);
        replacement.on_admit("a");
        for _ in 0..9 {
            replacement.on_hit("a", 10);
        }
        replacement.on_remove("a");
        replacement.on_admit("b");
        replacement.on_hit("b", 10);
        replacement.on_remove("b");
        assert_eq!(replacement.age(), 10);
    }

    #[test]
    fn gdsf_divides_hits_by_size_cost() {
        let mut replacement = Replacement::new(ReplaceMode::LfudaGdsf);
        replacement.on_admit("big");
        for _ in 0..8 {
            replacement.on_hit("big", 4096);
        }
        // 8 hits / 4 KiB
        assert_eq!(replacement.priority("big"), 2);
    }

    #[test]
    fn gdsf_zero_byte_file_costs_one_kib() {
        let mut replacement = Replacement::new(ReplaceMode::LfudaGdsf);
        replacement.on_admit("empty");
        replacement.on_hit("empty", 0);
        assert_eq!(replacement.priority("empty"), 1);
    }

    #[test]
    fn first_hit_on_unknown_file_counts_from_one() {
        let mut replacement = Replacement::new(ReplaceMode::Lfuda);
        replacement.on_hit("fresh", 10);
        assert_eq!(replacement.priority("fresh"), 1);
    }

    #[test]
    fn lru_orders_by_recency() {
        let mut replacement = Replacement::new(ReplaceMode::Lru);
        replacement.on_admit("old");
        std::thread::sleep(std::time::Duration::from_millis(2));
        replacement.on_admit("new");
        assert!(replacement.priority("new") > replacement.priority("old"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        replacement.on_hit("old", 1);
        assert!(replacement.priority("old") > replacement.priority("new"));
    }

    #[test]
    fn persist_and_restore_preserve_lfuda_ordering() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = index_path(dir.path(), 0);

        let mut replacement = Replacement::new(ReplaceMode::Lfuda);
        for (name, hits) in [("hot", 9), ("warm", 4), ("cold", 1)] {
            replacement.on_admit(name);
            for _ in 0..hits {
                replacement.on_hit(name, 64);
            }
        }
        replacement.persist(&path)?;

        let mut restored = Replacement::new(ReplaceMode::Lfuda);
        restored.restore(&path);
        assert!(restored.priority("hot") > restored.priority("warm"));
        assert!(restored.priority("warm") > restored.priority("cold"));
        Ok(())
    }

    #[test]
    fn restore_ignores_type_mismatch() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = index_path(dir.path(), 0);

        let mut lru = Replacement::new(ReplaceMode::Lru);
        lru.on_admit("a");
        lru.persist(&path)?;

        let mut lfuda = Replacement::new(ReplaceMode::Lfuda);
        lfuda.restore(&path);
        assert_eq!(lfuda.priority("a"), 0);
        Ok(())
    }

    #[test]
    fn restore_ignores_garbage() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = index_path(dir.path(), 0);
        std::fs::write(&path, b"not json at all")?;

        let mut replacement = Replacement::new(ReplaceMode::Lfuda);
        replacement.restore(&path);
        assert_eq!(replacement.age(), 0);
        assert_eq!(replacement.priority("a"), 0);
        Ok(())
    }

    #[test]
    fn lru_restore_rebases_below_new_hits() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = index_path(dir.path(), 3);

        let mut replacement = Replacement::new(ReplaceMode::Lru);
        replacement.on_admit("a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        replacement.on_admit("b");
        replacement.persist(&path)?;

        let mut restored = Replacement::new(ReplaceMode::Lru);
        restored.restore(&path);
        let stored_a = restored.priority("a");
        let stored_b = restored.priority("b");
        assert!(stored_b > stored_a);

        restored.on_hit("a", 1);
        assert!(restored.priority("a") > stored_b);
        Ok(())
    }

    #[test]
    fn persist_writes_via_rename() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = index_path(dir.path(), 0);
        let replacement = Replacement::new(ReplaceMode::Lfuda);
        replacement.persist(&path)?;
        assert!(path.exists());
        let leftover: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with("_tmp"))
            .collect();
        assert!(leftover.is_empty());
        Ok(())
    }
}
