use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::service::{Dispatcher, SendMode};

/// A registered content sink: where to deliver, how (unicast or
/// multicast), and with what send parameters.
#[derive(Debug, Clone)]
pub struct NotifySpec {
    pub mode: SendMode,
    pub name: String,
    pub timeout: Duration,
    pub priority: i8,
}

/// Delivers the current contents to every subscription on the file.
/// Delivery failures are logged and do not affect the triggering request.
pub async fn deliver(dispatcher: &Arc<dyn Dispatcher>, specs: &[NotifySpec], contents: &Bytes) {
    for spec in specs {
        if let Err(err) = dispatcher
            .send(
                spec.mode,
                &spec.name,
                contents.clone(),
                spec.timeout,
                spec.priority,
            )
            .await
        {
            warn!(target_name = %spec.name, error = %err, "notification delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Registry;

    #[tokio::test]
    async fn delivers_to_every_sink() {
        let registry = Arc::new(Registry::new("/files/"));
        let dispatcher: Arc<dyn Dispatcher> = registry.clone();
        let specs = vec![
            NotifySpec {
                mode: SendMode::Unicast,
                name: "/sink/one".to_string(),
                timeout: Duration::from_secs(1),
                priority: 0,
            },
            NotifySpec {
                mode: SendMode::Multicast,
                name: "/sink/all".to_string(),
                timeout: Duration::from_secs(1),
                priority: 0,
            },
        ];
        deliver(&dispatcher, &specs, &Bytes::from_static(b"abc")).await;

        let sent = registry.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].mode, SendMode::Unicast);
        assert_eq!(sent[1].name, "/sink/all");
        assert_eq!(sent[1].body.as_ref(), b"abc");
    }
}
