use std::collections::BTreeMap;
use std::time::SystemTime;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use tokio::task;
use tracing::{debug, warn};

use super::Origin;
use super::notify::{self, NotifySpec};
use super::protocol;
use super::scanner::{self, ScannedFile};
use super::table::FileEntry;

enum Admitted {
    Ok,
    CeilingHit,
}

impl Origin {
    /// One refresh: scan, admit in replacement-priority order under the
    /// byte ceiling, prune records the scan did not touch, persist the
    /// replacement index, fire change notifications.
    pub(super) async fn refresh_cycle(&mut self) -> Result<()> {
        let root = self.root.clone();
        let allowlist = self.allowlist.clone();
        let scanned = task::spawn_blocking(move || scanner::scan(&root, allowlist.as_deref()))
            .await
            .map_err(|err| anyhow!("scan task failed: {err}"))??;

        self.toggle = !self.toggle;
        let toggle = self.toggle;

        let mut candidates = scanned;
        let rebuild = self.replacement.is_some();
        if let Some(replacement) = &self.replacement {
            // Highest priority first; smaller files win ties. Usage is
            // rebuilt from zero so admission order decides who fits.
            candidates.sort_by(|a, b| {
                replacement
                    .priority(&b.name)
                    .cmp(&replacement.priority(&a.name))
                    .then(a.size.cmp(&b.size))
            });
            self.budget.reset();
        }

        let mut notifications: Vec<(Vec<NotifySpec>, Bytes)> = Vec::new();
        for file in candidates {
            match self.refresh_file(file, rebuild, &mut notifications).await {
                Admitted::Ok => {}
                // The ceiling is hit: every lower-priority candidate is
                // implicitly dropped and pruned below.
                Admitted::CeilingHit => break,
            }
        }

        self.prune_stale(toggle, rebuild).await;

        if let Some(replacement) = self.replacement.as_mut() {
            let known: std::collections::HashSet<String> =
                self.table.filenames().into_iter().collect();
            replacement.retain(|filename| known.contains(filename));
            if self.replace_index
                && let Err(err) = replacement.persist(&self.index_path)
            {
                warn!(error = %err, "failed to persist replacement index");
            }
        }

        for (specs, contents) in notifications {
            notify::deliver(&self.dispatcher, &specs, &contents).await;
        }

        debug!(
            files = self.table.len(),
            bytes = self.budget.in_use(),
            "refresh complete"
        );
        Ok(())
    }

    async fn refresh_file(
        &mut self,
        file: ScannedFile,
        rebuild: bool,
        notifications: &mut Vec<(Vec<NotifySpec>, Bytes)>,
    ) -> Admitted {
        let toggle = self.toggle;

        let data = match tokio::fs::read(&file.path).await {
            Ok(data) => scanner::apply_segment(data, file.segment),
            Err(err) => {
                warn!(filename = %file.name, error = %err, "file read failed");
                // An update keeps its previous generation only when writes
                // are declared; otherwise the stale toggle prunes it.
                if let Some(entry) = self.table.get_mut(&file.name)
                    && entry.write.any()
                {
                    entry.toggle = toggle;
                    let size = entry.size;
                    if rebuild && self.budget.admit(0, size).is_err() {
                        return Admitted::CeilingHit;
                    }
                }
                return Admitted::Ok;
            }
        };

        // A rewrite can land inside one mtime tick, so the stamp alone
        // cannot witness "unchanged"; the bytes have to agree too.
        let unchanged = self.table.get(&file.name).is_some_and(|entry| {
            entry.mtime_i.0 == file.mtime
                && entry.segment == file.segment
                && entry.contents.as_ref() == data.as_slice()
        });

        if unchanged {
            let size = data.len() as u64;
            if rebuild && self.budget.admit(0, size).is_err() {
                warn!(filename = %file.name, "file dropped; byte ceiling reached");
                return Admitted::CeilingHit;
            }
            let entry = self.table.get_mut(&file.name).expect("unchanged record");
            entry.toggle = toggle;
            entry.access = file.access;
            return Admitted::Ok;
        }

        let new_size = data.len() as u64;
        let old_size = if rebuild {
            0
        } else {
            self.table.get(&file.name).map(|entry| entry.size).unwrap_or(0)
        };
        if let Err(err) = self.budget.admit(old_size, new_size) {
            warn!(filename = %file.name, error = %err, "file skipped by size budget");
            if rebuild {
                return Admitted::CeilingHit;
            }
            // Keep the previous generation alive when one exists.
            if let Some(entry) = self.table.get_mut(&file.name) {
                entry.toggle = toggle;
            }
            return Admitted::Ok;
        }

        match self.table.get_mut(&file.name) {
            Some(entry) => {
                entry.toggle = toggle;
                entry.access = file.access;
                entry.path = file.path.clone();
                entry.segment = file.segment;
                entry.mtime_i = super::bump_mtime(entry.mtime_i, file.mtime);
                entry.set_contents(Bytes::from(data));
                if !entry.notify.is_empty() {
                    notifications.push((entry.notify.clone(), entry.contents.clone()));
                }
                debug!(filename = %file.name, size = new_size, "file updated");
            }
            None => {
                let (write, notify_specs, redirect) = self.pattern_state_for(&file.name);
                let notify_on_load = self.initialized;
                let entry = FileEntry {
                    contents: Bytes::from(data),
                    size: new_size,
                    path: file.path.clone(),
                    headers: protocol::file_headers(
                        &file.name,
                        self.use_content_types,
                        self.use_content_disposition,
                    ),
                    mtime_i: (file.mtime, 0),
                    access: file.access,
                    toggle,
                    notify: notify_specs,
                    write,
                    write_appends: BTreeMap::new(),
                    redirect,
                    segment: file.segment,
                };
                if notify_on_load && !entry.notify.is_empty() {
                    notifications.push((entry.notify.clone(), entry.contents.clone()));
                }
                let added = self
                    .table
                    .insert(file.name.clone(), entry, self.use_http_get_suffix);
                for suffix in added {
                    if let Err(err) = self.dispatcher.subscribe(&suffix).await {
                        warn!(suffix, error = %err, "subscribe failed");
                    }
                }
                if let Some(replacement) = self.replacement.as_mut() {
                    replacement.on_admit(&file.name);
                }
                debug!(filename = %file.name, size = new_size, "file loaded");
            }
        }
        Admitted::Ok
    }

    /// Records the scan did not touch this cycle: write-declared ones
    /// persist as empty files, the rest are removed outright. When usage
    /// was rebuilt this cycle the stale records were never re-admitted, so
    /// nothing is released for them.
    async fn prune_stale(&mut self, toggle: bool, rebuild: bool) {
        let stale: Vec<String> = self
            .table
            .iter()
            .filter(|(_, entry)| entry.toggle != toggle)
            .map(|(filename, _)| filename.clone())
            .collect();

        for filename in stale {
            let write_declared = self
                .table
                .get(&filename)
                .is_some_and(|entry| entry.write.any());
            if write_declared {
                let entry = self.table.get_mut(&filename).expect("stale record");
                entry.toggle = toggle;
                if entry.size > 0 {
                    let size = entry.size;
                    entry.set_contents(Bytes::new());
                    entry.mtime_i = super::bump_mtime(entry.mtime_i, SystemTime::now());
                    if !rebuild {
                        self.budget.release(size);
                    }
                    debug!(filename, "write endpoint reset to empty");
                }
                continue;
            }

            let (entry, removed) = self.table.remove(&filename);
            for suffix in removed {
                if let Err(err) = self.dispatcher.unsubscribe(&suffix).await {
                    warn!(suffix, error = %err, "unsubscribe failed");
                }
            }
            if !rebuild && let Some(entry) = entry {
                self.budget.release(entry.size);
            }
            if let Some(replacement) = self.replacement.as_mut() {
                replacement.on_remove(&filename);
            }
            debug!(filename, "file removed");
        }
    }
}
