#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use shelf::origin::{self, OriginHandle};
use shelf::service::{Registry, Request, Response};
use shelf::settings::Settings;

/// An origin actor over a scratch directory plus the registry standing in
/// for the dispatching framework.
pub struct TestOrigin {
    pub handle: OriginHandle,
    pub registry: Arc<Registry>,
    prefix: String,
}

impl TestOrigin {
    pub async fn spawn(settings: Settings) -> Result<Self> {
        let registry = Arc::new(Registry::new(settings.prefix.clone()));
        let prefix = settings.prefix.clone();
        let (handle, _actor) = origin::spawn(settings, registry.clone()).await?;
        Ok(Self {
            handle,
            registry,
            prefix,
        })
    }

    pub async fn request(&self, suffix: &str, headers: HeaderMap, body: &[u8]) -> Result<Response> {
        self.request_with_timeout(suffix, headers, body, Duration::from_secs(5))
            .await
    }

    pub async fn request_with_timeout(
        &self,
        suffix: &str,
        headers: HeaderMap,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Response> {
        let mut request = Request::new(format!("{}{suffix}", self.prefix));
        request.headers = headers;
        request.body = Bytes::copy_from_slice(body);
        request.timeout = timeout;
        self.handle.request(request).await
    }

    pub async fn get(&self, filename: &str) -> Result<Response> {
        self.request(&format!("{filename}/get"), HeaderMap::new(), b"")
            .await
    }

    pub async fn get_with(&self, filename: &str, headers: HeaderMap) -> Result<Response> {
        self.request(&format!("{filename}/get"), headers, b"").await
    }

    pub async fn put(&self, filename: &str, body: &[u8]) -> Result<Response> {
        self.request(&format!("{filename}/put"), HeaderMap::new(), body)
            .await
    }
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(
            HeaderName::try_from(*name).expect("test header name"),
            HeaderValue::from_str(value).expect("test header value"),
        );
    }
    map
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(path, contents).expect("write fixture file");
}

/// Refresh ticks fire on a one-second cadence in these tests; this waits
/// out one full cycle.
pub async fn wait_for_refresh() {
    tokio::time::sleep(Duration::from_millis(1400)).await;
}
