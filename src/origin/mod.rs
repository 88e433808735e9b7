use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http::header::{LOCATION, RANGE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod append;
pub mod budget;
pub mod name;
pub mod notify;
pub mod pattern;
pub mod protocol;
pub mod range;
mod refresh;
pub mod replace;
pub mod scanner;
pub mod table;

use crate::service::{Dispatcher, Request, Response, SendMode};
use crate::settings::Settings;
use append::AppendChunk;
use budget::SizeBudget;
use name::EndpointKind;
use notify::NotifySpec;
use protocol::{IfRangeStatus, ProtocolConfig};
use range::RangeHeader;
use replace::Replacement;
use scanner::{Access, ReadSpec, Segment};
use table::{FileEntry, FileTable, WriteSet};

const MULTIPART_ID: &str = "x-multipart-id";
const MULTIPART_INDEX: &str = "x-multipart-index";
const MULTIPART_LAST: &str = "x-multipart-last";

/// Everything the actor processes: requests from the framework, the
/// periodic refresh tick, and per-upload expiry. The enum is closed, so an
/// unknown message is unrepresentable rather than a runtime fault.
enum Msg {
    Request(Request, oneshot::Sender<Response>),
    Refresh,
    AppendExpired { filename: String, id: String },
}

/// Client handle onto the origin actor; replies correspond 1:1 with
/// requests, in arrival order.
#[derive(Clone)]
pub struct OriginHandle {
    tx: mpsc::Sender<Msg>,
}

impl OriginHandle {
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Msg::Request(request, reply_tx))
            .await
            .map_err(|_| anyhow!("origin actor stopped"))?;
        reply_rx.await.context("origin actor dropped the reply")
    }
}

/// The single-threaded cooperative actor owning the file table, budget,
/// and replacement state. All mutation is serialized through its message
/// loop; the filesystem and notification sends are the only suspension
/// points.
pub struct Origin {
    root: PathBuf,
    prefix: String,
    protocol: ProtocolConfig,
    use_http_get_suffix: bool,
    use_content_types: bool,
    use_content_disposition: bool,
    refresh_interval: Option<Duration>,
    replace_index: bool,
    index_path: PathBuf,
    allowlist: Option<Vec<ReadSpec>>,
    notify_timeout: Duration,
    notify_priority: i8,
    notify_on_start: bool,
    write_truncate: Vec<String>,
    write_append: Vec<String>,
    redirects: Vec<(String, String)>,
    notifies: Vec<(SendMode, String, String)>,
    dispatcher: Arc<dyn Dispatcher>,
    table: FileTable,
    budget: SizeBudget,
    replacement: Option<Replacement>,
    toggle: bool,
    /// False during the initial scan: load-time notifications are governed
    /// by `notify_on_start`, not by the refresh rules.
    initialized: bool,
    tx: mpsc::Sender<Msg>,
    rx: mpsc::Receiver<Msg>,
}

/// Builds the actor, runs initialization (initial scan, pattern
/// application, startup notifications), and spawns the message loop.
/// Initialization failures are fatal and surface here.
pub async fn spawn(
    settings: Settings,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<(OriginHandle, JoinHandle<Result<()>>)> {
    let (tx, rx) = mpsc::channel(64);
    let mut origin = Origin::new(settings, dispatcher, tx.clone(), rx)?;
    origin.init().await?;
    let handle = OriginHandle { tx };
    let join = tokio::spawn(async move { origin.run().await });
    Ok((handle, join))
}

impl Origin {
    fn new(
        settings: Settings,
        dispatcher: Arc<dyn Dispatcher>,
        tx: mpsc::Sender<Msg>,
        rx: mpsc::Receiver<Msg>,
    ) -> Result<Self> {
        settings.validate()?;

        let refresh_interval = settings.refresh_interval();
        let root = match settings.directory.canonicalize() {
            Ok(root) => root,
            Err(err) if refresh_interval.is_some() => {
                warn!(
                    path = %settings.directory.display(),
                    error = %err,
                    "directory unreachable; refresh will retry"
                );
                settings.directory.clone()
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "directory '{}' unreachable with refresh disabled (enoent)",
                        settings.directory.display()
                    )
                });
            }
        };

        let mut replacement = settings.replace.map(Replacement::new);
        let index_path = replace::index_path(&root, settings.process_index);
        if settings.replace_index
            && let Some(replacement) = replacement.as_mut()
        {
            replacement.restore(&index_path);
        }

        let protocol = ProtocolConfig {
            cache_seconds: settings.cache_seconds(),
            use_expires: settings.use_expires,
            clock_skew_max: Duration::from_secs(settings.http_clock_skew_max),
            http_methods: settings.use_http_get_suffix,
        };

        Ok(Self {
            root,
            prefix: settings.prefix.clone(),
            protocol,
            use_http_get_suffix: settings.use_http_get_suffix,
            use_content_types: settings.use_content_types,
            use_content_disposition: settings.use_content_disposition,
            refresh_interval,
            replace_index: settings.replace_index,
            index_path,
            allowlist: (!settings.read.is_empty()).then(|| settings.read.clone()),
            notify_timeout: Duration::from_secs(settings.notify_timeout),
            notify_priority: settings.notify_priority,
            notify_on_start: settings.notify_on_start,
            write_truncate: settings.write_truncate.clone(),
            write_append: settings.write_append.clone(),
            redirects: settings
                .redirect
                .iter()
                .map(|spec| (spec.pattern.clone(), spec.target.clone()))
                .collect(),
            notifies: settings
                .notify_one
                .iter()
                .map(|spec| (SendMode::Unicast, spec.pattern.clone(), spec.name.clone()))
                .chain(
                    settings
                        .notify_all
                        .iter()
                        .map(|spec| (SendMode::Multicast, spec.pattern.clone(), spec.name.clone())),
                )
                .collect(),
            dispatcher,
            table: FileTable::new(),
            budget: SizeBudget::new(settings.files_size),
            replacement,
            toggle: false,
            initialized: false,
            tx,
            rx,
        })
    }

    async fn init(&mut self) -> Result<()> {
        match self.refresh_cycle().await {
            Ok(()) => {}
            Err(err) if self.refresh_interval.is_some() => {
                warn!(error = %err, "initial scan failed; refresh will retry");
            }
            Err(err) => return Err(err.context("initial directory scan failed")),
        }

        self.apply_write_patterns().await?;
        self.apply_redirects()?;
        self.apply_notify_patterns()?;
        self.check_write_access()?;

        if self.notify_on_start {
            let targets: Vec<(Vec<NotifySpec>, Bytes)> = self
                .table
                .iter()
                .filter(|(_, entry)| !entry.notify.is_empty())
                .map(|(_, entry)| (entry.notify.clone(), entry.contents.clone()))
                .collect();
            for (specs, contents) in targets {
                notify::deliver(&self.dispatcher, &specs, &contents).await;
            }
        }

        self.initialized = true;
        self.schedule_refresh();
        info!(
            root = %self.root.display(),
            files = self.table.len(),
            bytes = self.budget.in_use(),
            "origin initialized"
        );
        Ok(())
    }

    async fn run(mut self) -> Result<()> {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Msg::Request(request, reply) => {
                    let response = self.handle_request(&request).await;
                    let _ = reply.send(response);
                }
                Msg::Refresh => {
                    if let Err(err) = self.refresh_cycle().await {
                        warn!(error = %err, "refresh failed");
                    }
                    self.schedule_refresh();
                }
                Msg::AppendExpired { filename, id } => self.expire_append(&filename, &id),
            }
        }
        Ok(())
    }

    fn schedule_refresh(&self) {
        let Some(interval) = self.refresh_interval else {
            return;
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(Msg::Refresh).await;
        });
    }

    async fn handle_request(&mut self, request: &Request) -> Response {
        let Some(suffix) = request.name.strip_prefix(&self.prefix).map(str::to_string) else {
            return Response::with_status(StatusCode::NOT_FOUND);
        };
        let Some(endpoint) = self.table.lookup(&suffix).cloned() else {
            return Response::with_status(StatusCode::NOT_FOUND);
        };
        let filename = endpoint.filename;

        if let Some(target) = self
            .table
            .get(&filename)
            .and_then(|entry| entry.redirect.clone())
        {
            let mut response = Response::with_status(StatusCode::MOVED_PERMANENTLY);
            if let Ok(value) = HeaderValue::from_str(&format!("{}{target}", self.prefix)) {
                response.headers.insert(LOCATION, value);
            }
            return response;
        }

        let response = match endpoint.kind {
            EndpointKind::Bare => {
                let entry = self.table.get(&filename).expect("endpoint without record");
                Response {
                    status: StatusCode::OK,
                    headers: entry.headers.clone(),
                    body: entry.contents.clone(),
                }
            }
            EndpointKind::Options => {
                let tags = self.table.method_tags(&suffix, &filename);
                protocol::options_response(&tags, &self.protocol)
            }
            EndpointKind::Head | EndpointKind::Get => {
                let entry = self.table.get(&filename).expect("endpoint without record");
                protocol::read_response(
                    &request.headers,
                    &entry.contents,
                    &entry.headers,
                    entry.mtime_i,
                    endpoint.kind == EndpointKind::Head,
                    &self.protocol,
                )
            }
            EndpointKind::Put => self.handle_put(&filename, request).await,
            EndpointKind::Post => self.handle_post(&filename, request).await,
        };

        if endpoint.kind != EndpointKind::Options
            && response.status.as_u16() < 400
            && let Some(size) = self.table.get(&filename).map(|entry| entry.size)
            && let Some(replacement) = self.replacement.as_mut()
        {
            replacement.on_hit(&filename, size);
        }
        response
    }

    /// PUT: a truncating replacement of the whole file. The body lands on
    /// disk first; the restat after the write is the authoritative mtime.
    async fn handle_put(&mut self, filename: &str, request: &Request) -> Response {
        let Some(entry) = self.table.get(filename) else {
            return Response::with_status(StatusCode::NOT_FOUND);
        };
        if !entry.write.truncate || request.headers.contains_key(RANGE) {
            return Response::with_status(StatusCode::BAD_REQUEST);
        }

        let old_size = entry.size;
        let new_size = request.body.len() as u64;
        if let Err(err) = self.budget.admit(old_size, new_size) {
            warn!(filename, error = %err, "truncate write rejected by size budget");
            return Response::with_status(StatusCode::BAD_REQUEST);
        }

        let entry = self.table.get_mut(filename).expect("record vanished");
        let path = entry.path.clone();
        if let Err(err) = write_file(&path, &request.body).await {
            warn!(filename, error = %err, "truncate write failed");
            let _ = self.budget.admit(new_size, old_size);
            return Response::with_status(StatusCode::INTERNAL_SERVER_ERROR);
        }

        let (mtime, access) = restat(&path).await;
        entry.mtime_i = bump_mtime(entry.mtime_i, mtime);
        if let Some(access) = access {
            entry.access = access;
        }
        entry.set_contents(request.body.clone());

        notify::deliver(&self.dispatcher, &entry.notify, &entry.contents).await;
        protocol::read_response(
            &HeaderMap::new(),
            &entry.contents,
            &entry.headers,
            entry.mtime_i,
            false,
            &self.protocol,
        )
    }

    /// POST: a byte-range append, possibly one chunk of a multipart upload
    /// keyed by `x-multipart-id`. Non-terminal chunks buffer under a
    /// per-id expiry timer; the terminal chunk drains the buffer and
    /// applies every chunk in index order.
    async fn handle_post(&mut self, filename: &str, request: &Request) -> Response {
        let Some(entry) = self.table.get(filename) else {
            return Response::with_status(StatusCode::NOT_FOUND);
        };
        if !entry.write.append {
            return Response::with_status(StatusCode::BAD_REQUEST);
        }
        let len = entry.size;
        let etag = protocol::etag_value(entry.mtime_i);
        let mtime = entry.mtime_i.0;

        let id = header_str(&request.headers, MULTIPART_ID).map(str::to_string);
        let index: u32 = header_str(&request.headers, MULTIPART_INDEX)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0);
        let is_last = match header_str(&request.headers, MULTIPART_LAST) {
            Some(value) => value.trim().eq_ignore_ascii_case("true"),
            None => id.is_none(),
        };

        let payload_len = request.body.len() as u64;
        let spec = match range::parse(&request.headers) {
            RangeHeader::None => None,
            RangeHeader::NotBytes => return Response::with_status(StatusCode::RANGE_NOT_SATISFIABLE),
            RangeHeader::Malformed => return Response::with_status(StatusCode::BAD_REQUEST),
            RangeHeader::Bytes(specs) => {
                if protocol::if_range_status(&request.headers, &etag, mtime) == IfRangeStatus::Stale
                {
                    return Response::with_status(StatusCode::GONE);
                }
                if let [only] = specs[..] {
                    Some(only)
                } else {
                    match specs.get(index as usize) {
                        Some(spec) => Some(*spec),
                        None => return Response::with_status(StatusCode::BAD_REQUEST),
                    }
                }
            }
        };
        let Some((start, end)) = range::resolve_write(spec, len, payload_len) else {
            return Response::with_status(StatusCode::RANGE_NOT_SATISFIABLE);
        };

        let id_key = id.unwrap_or_default();
        let entry = self.table.get_mut(filename).expect("record vanished");
        let pending = entry.write_appends.entry(id_key.clone()).or_default();
        pending.store(AppendChunk {
            index,
            start,
            end,
            data: request.body.clone(),
        });

        if !is_last {
            if !pending.has_timer() {
                let tx = self.tx.clone();
                let filename = filename.to_string();
                let timeout = request.timeout;
                pending.set_timer(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(Msg::AppendExpired { filename, id: id_key }).await;
                }));
            }
            let headers =
                protocol::base_headers(&self.protocol, &etag, mtime, SystemTime::now());
            return Response {
                status: StatusCode::OK,
                headers,
                body: Bytes::new(),
            };
        }

        let pending = entry.write_appends.remove(&id_key).unwrap_or_default();
        let chunks = pending.into_chunks();
        let mut buf = entry.contents.to_vec();
        for chunk in &chunks {
            append::splice(&mut buf, chunk.start, chunk.end, &chunk.data);
        }

        let old_size = entry.size;
        let new_size = buf.len() as u64;
        if let Err(err) = self.budget.admit(old_size, new_size) {
            warn!(filename, error = %err, "append write rejected by size budget");
            return Response::with_status(StatusCode::BAD_REQUEST);
        }

        let path = entry.path.clone();
        if let Err(err) = write_file(&path, &buf).await {
            warn!(filename, error = %err, "append write failed");
            let _ = self.budget.admit(new_size, old_size);
            return Response::with_status(StatusCode::INTERNAL_SERVER_ERROR);
        }

        let (mtime, access) = restat(&path).await;
        entry.mtime_i = bump_mtime(entry.mtime_i, mtime);
        if let Some(access) = access {
            entry.access = access;
        }
        entry.set_contents(Bytes::from(buf));

        notify::deliver(&self.dispatcher, &entry.notify, &entry.contents).await;
        protocol::read_response(
            &HeaderMap::new(),
            &entry.contents,
            &entry.headers,
            entry.mtime_i,
            false,
            &self.protocol,
        )
    }

    fn expire_append(&mut self, filename: &str, id: &str) {
        if let Some(entry) = self.table.get_mut(filename)
            && entry.write_appends.remove(id).is_some()
        {
            debug!(filename, id, "incomplete multipart upload discarded");
        }
    }

    async fn apply_write_patterns(&mut self) -> Result<()> {
        let passes = [
            (self.write_truncate.clone(), true),
            (self.write_append.clone(), false),
        ];
        for (patterns, truncate) in passes {
            for pat in patterns {
                let matched: Vec<String> = self
                    .table
                    .filenames()
                    .into_iter()
                    .filter(|filename| pattern::matches(&pat, filename))
                    .collect();
                if matched.is_empty() {
                    if pattern::is_pattern(&pat) {
                        bail!("write pattern '{pat}' matches no files (enoent)");
                    }
                    self.preallocate(&pat, truncate).await?;
                    continue;
                }
                for filename in matched {
                    {
                        let entry = self.table.get_mut(&filename).expect("matched record");
                        if truncate {
                            entry.write.truncate = true;
                        } else {
                            entry.write.append = true;
                        }
                    }
                    self.resync_endpoints(&filename).await?;
                }
            }
        }
        Ok(())
    }

    /// A literal write target with no on-disk counterpart starts life as
    /// an empty record; it persists through refresh cycles that do not see
    /// the file.
    async fn preallocate(&mut self, filename: &str, truncate: bool) -> Result<()> {
        let write = WriteSet {
            truncate,
            append: !truncate,
        };
        let entry = FileEntry {
            contents: Bytes::new(),
            size: 0,
            path: self.root.join(filename),
            headers: protocol::file_headers(
                filename,
                self.use_content_types,
                self.use_content_disposition,
            ),
            mtime_i: (SystemTime::now(), 0),
            access: Access::ReadWrite,
            toggle: self.toggle,
            notify: Vec::new(),
            write,
            write_appends: BTreeMap::new(),
            redirect: None,
            segment: Segment::default(),
        };
        let added = self
            .table
            .insert(filename.to_string(), entry, self.use_http_get_suffix);
        for suffix in added {
            self.dispatcher.subscribe(&suffix).await?;
        }
        if let Some(replacement) = self.replacement.as_mut() {
            replacement.on_admit(filename);
        }
        debug!(filename, "write endpoint preallocated");
        Ok(())
    }

    async fn resync_endpoints(&mut self, filename: &str) -> Result<()> {
        let (added, removed) = self
            .table
            .sync_endpoints(filename, self.use_http_get_suffix);
        for suffix in added {
            self.dispatcher.subscribe(&suffix).await?;
        }
        for suffix in removed {
            self.dispatcher.unsubscribe(&suffix).await?;
        }
        Ok(())
    }

    fn apply_redirects(&mut self) -> Result<()> {
        for (pat, target) in self.redirects.clone() {
            let matched: Vec<String> = self
                .table
                .filenames()
                .into_iter()
                .filter(|filename| pattern::matches(&pat, filename))
                .collect();
            if matched.is_empty() {
                bail!("redirect pattern '{pat}' matches no files (enoent)");
            }
            for filename in matched {
                let caps = pattern::captures(&pat, &filename).expect("matched pattern");
                let dest = pattern::substitute(&target, &caps)?;
                self.table.get_mut(&filename).expect("matched record").redirect = Some(dest);
            }
        }
        Ok(())
    }

    fn apply_notify_patterns(&mut self) -> Result<()> {
        for (_, pat, _) in &self.notifies {
            let matched = self
                .table
                .filenames()
                .iter()
                .any(|filename| pattern::matches(pat, filename));
            if !matched {
                bail!("notify pattern '{pat}' matches no files (enoent)");
            }
        }
        // Assign rather than accumulate: the initial scan may already have
        // attached these specs to newly loaded files.
        let assignments: Vec<(String, Vec<NotifySpec>)> = self
            .table
            .filenames()
            .into_iter()
            .map(|filename| {
                let (_, notify, _) = self.pattern_state_for(&filename);
                (filename, notify)
            })
            .collect();
        for (filename, notify) in assignments {
            self.table.get_mut(&filename).expect("listed record").notify = notify;
        }
        Ok(())
    }

    fn check_write_access(&self) -> Result<()> {
        for (filename, entry) in self.table.iter() {
            if entry.write.any() && entry.access != Access::ReadWrite {
                bail!("file '{filename}' access mode forbids the requested writes (eacces)");
            }
        }
        Ok(())
    }

    /// The write set and notification/redirect wiring a file appearing
    /// mid-life picks up from the configured patterns.
    fn pattern_state_for(&self, filename: &str) -> (WriteSet, Vec<NotifySpec>, Option<String>) {
        let write = WriteSet {
            truncate: self
                .write_truncate
                .iter()
                .any(|pat| pattern::matches(pat, filename)),
            append: self
                .write_append
                .iter()
                .any(|pat| pattern::matches(pat, filename)),
        };
        let notify = self
            .notifies
            .iter()
            .filter(|(_, pat, _)| pattern::matches(pat, filename))
            .map(|(mode, _, target)| NotifySpec {
                mode: *mode,
                name: target.clone(),
                timeout: self.notify_timeout,
                priority: self.notify_priority,
            })
            .collect();
        let redirect = self.redirects.iter().find_map(|(pat, target)| {
            let caps = pattern::captures(pat, filename)?;
            pattern::substitute(target, &caps).ok()
        });
        (write, notify, redirect)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}

/// The ETag encodes the modification time at second granularity, so any
/// generation landing in the same second as its predecessor bumps the
/// counter instead.
fn bump_mtime(old: (SystemTime, u32), new_mtime: SystemTime) -> (SystemTime, u32) {
    if protocol::gregorian_seconds(new_mtime) == protocol::gregorian_seconds(old.0) {
        (new_mtime, old.1.wrapping_add(1))
    } else {
        (new_mtime, 0)
    }
}

async fn write_file(path: &std::path::Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Write-then-stat: the restat is the authoritative modification time.
/// When even the stat fails the wall clock stands in.
async fn restat(path: &std::path::Path) -> (SystemTime, Option<Access>) {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => (
            metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            Some(scanner::access_mode(&metadata)),
        ),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "restat after write failed");
            (SystemTime::now(), None)
        }
    }
}
