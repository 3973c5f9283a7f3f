use async_trait::async_trait;
use common::domain::{DecodedDeviceRequest, DeviceEventManagement, DomainError, DomainResult};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Decides whether a decoded request has been seen before.
///
/// Called concurrently from every receiver worker.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceEventDeduplicator: Send + Sync {
    async fn start(&self) -> DomainResult<()>;

    async fn stop(&self) -> DomainResult<()>;

    async fn is_duplicate(&self, request: &DecodedDeviceRequest) -> DomainResult<bool>;

    /// Undo the bookkeeping done by `is_duplicate` for a request that will be
    /// redelivered, so the retry is not mistaken for a duplicate.
    async fn forget(&self, request: &DecodedDeviceRequest) -> DomainResult<()>;
}

/// Duplicate iff an event with the request's alternate id is already stored.
///
/// Requests without an alternate id are never duplicates. Two copies of the
/// same request arriving at the same moment can both pass the check.
pub struct AlternateIdDeduplicator {
    events: Arc<dyn DeviceEventManagement>,
}

impl AlternateIdDeduplicator {
    pub fn new(events: Arc<dyn DeviceEventManagement>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl DeviceEventDeduplicator for AlternateIdDeduplicator {
    async fn start(&self) -> DomainResult<()> {
        info!("alternate id deduplicator started");
        Ok(())
    }

    async fn stop(&self) -> DomainResult<()> {
        Ok(())
    }

    async fn is_duplicate(&self, request: &DecodedDeviceRequest) -> DomainResult<bool> {
        let Some(alternate_id) = request.request.alternate_id.as_deref() else {
            return Ok(false);
        };

        let existing = self
            .events
            .get_device_event_by_alternate_id(alternate_id)
            .await?;
        if let Some(event) = &existing {
            debug!(
                alternate_id = %alternate_id,
                event_id = %event.id,
                "alternate id already stored"
            );
        }
        Ok(existing.is_some())
    }

    async fn forget(&self, _request: &DecodedDeviceRequest) -> DomainResult<()> {
        Ok(())
    }
}

/// Remembers fingerprints of the most recent `capacity` requests.
///
/// A fingerprint is the SHA-256 of the device token plus the alternate id when
/// there is one, otherwise of the canonical JSON of the whole request.
pub struct RecentRequestDeduplicator {
    capacity: usize,
    window: Mutex<RecentWindow>,
}

#[derive(Default)]
struct RecentWindow {
    order: VecDeque<[u8; 32]>,
    members: HashSet<[u8; 32]>,
}

impl RecentRequestDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Mutex::new(RecentWindow::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.window.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.window.lock().await.order.is_empty()
    }
}

pub fn fingerprint(request: &DecodedDeviceRequest) -> DomainResult<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(request.device_token.as_bytes());
    hasher.update([0u8]);
    match request.request.alternate_id.as_deref() {
        Some(alternate_id) => {
            hasher.update(b"alt:");
            hasher.update(alternate_id.as_bytes());
        }
        None => {
            let canonical = serde_json::to_vec(&request.request).map_err(|e| {
                DomainError::InvalidEventRequest(format!("cannot fingerprint request: {}", e))
            })?;
            hasher.update(b"req:");
            hasher.update(&canonical);
        }
    }
    Ok(hasher.finalize().into())
}

#[async_trait]
impl DeviceEventDeduplicator for RecentRequestDeduplicator {
    async fn start(&self) -> DomainResult<()> {
        info!(capacity = self.capacity, "recent request deduplicator started");
        Ok(())
    }

    async fn stop(&self) -> DomainResult<()> {
        let mut window = self.window.lock().await;
        window.order.clear();
        window.members.clear();
        Ok(())
    }

    async fn is_duplicate(&self, request: &DecodedDeviceRequest) -> DomainResult<bool> {
        let key = fingerprint(request)?;
        let mut window = self.window.lock().await;

        if window.members.contains(&key) {
            return Ok(true);
        }

        window.order.push_back(key);
        window.members.insert(key);
        while window.order.len() > self.capacity {
            if let Some(evicted) = window.order.pop_front() {
                window.members.remove(&evicted);
            }
        }
        Ok(false)
    }

    async fn forget(&self, request: &DecodedDeviceRequest) -> DomainResult<()> {
        let key = fingerprint(request)?;
        let mut window = self.window.lock().await;
        if window.members.remove(&key) {
            window.order.retain(|k| *k != key);
        }
        Ok(())
    }
}
