use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tracing::debug;

/// How a notification is delivered to the surrounding framework: to one
/// subscriber of the target name, or to all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Unicast,
    Multicast,
}

/// An incoming service request. `name` is the full endpoint name, prefix
/// included; `headers` carries the request-info key/value pairs.
#[derive(Debug, Clone)]
pub struct Request {
    pub name: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
    pub priority: i8,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: Duration::from_secs(5),
            priority: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// The subscription surface the origin consumes from the dispatching
/// framework. Suffixes are endpoint names without the service prefix; the
/// framework owns prefix concatenation and request delivery.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn subscribe(&self, suffix: &str) -> Result<()>;
    async fn unsubscribe(&self, suffix: &str) -> Result<()>;
    async fn send(
        &self,
        mode: SendMode,
        name: &str,
        body: Bytes,
        timeout: Duration,
        priority: i8,
    ) -> Result<()>;
}

/// A notification the registry has accepted for delivery.
#[derive(Debug, Clone)]
pub struct SentNotification {
    pub mode: SendMode,
    pub name: String,
    pub body: Bytes,
}

/// In-process registry: the standalone daemon's stand-in for an external
/// dispatching framework. Tracks the subscription set and retains sends so
/// embedders (and the integration tests) can observe delivery.
pub struct Registry {
    prefix: String,
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    subscriptions: BTreeSet<String>,
    sent: Vec<SentNotification>,
}

impl Registry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Snapshot of the currently subscribed full names, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscriptions.iter().cloned().collect()
    }

    pub fn is_subscribed(&self, full_name: &str) -> bool {
        self.inner.lock().subscriptions.contains(full_name)
    }

    /// Drains the notifications accepted so far.
    pub fn take_sent(&self) -> Vec<SentNotification> {
        std::mem::take(&mut self.inner.lock().sent)
    }
}

#[async_trait]
impl Dispatcher for Registry {
    async fn subscribe(&self, suffix: &str) -> Result<()> {
        let full = format!("{}{suffix}", self.prefix);
        let mut inner = self.inner.lock();
        if !inner.subscriptions.insert(full.clone()) {
            bail!("duplicate subscription for '{full}'");
        }
        debug!(name = %full, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, suffix: &str) -> Result<()> {
        let full = format!("{}{suffix}", self.prefix);
        let mut inner = self.inner.lock();
        if !inner.subscriptions.remove(&full) {
            bail!("unsubscribe of unknown name '{full}'");
        }
        debug!(name = %full, "unsubscribed");
        Ok(())
    }

    async fn send(
        &self,
        mode: SendMode,
        name: &str,
        body: Bytes,
        timeout: Duration,
        priority: i8,
    ) -> Result<()> {
        let _ = (timeout, priority);
        debug!(name, bytes = body.len(), ?mode, "notification send");
        self.inner.lock().sent.push(SentNotification {
            mode,
            name: name.to_string(),
            body,
        });
        Ok(())
    }
}
