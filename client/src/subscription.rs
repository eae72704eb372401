//! Multiplexer over one push-stream connection: many per-address
//! subscribers, bundle reassembly, ordered dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use raam_spec::{RaamError, Record};

use crate::StreamClient;

/// Receives fully reassembled bundles for one subscribed address.
pub trait BundleHandler: Send + Sync {
    /// Called with the bundle's records ordered by `current_index`.
    fn on_bundle(&self, records: &[Record]);
}

/// A handle over one upstream push-stream connection shared by every
/// subscriber in the process. Cloning shares the connection and tables;
/// tests construct a fresh manager per run.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager").finish_non_exhaustive()
    }
}

struct ManagerInner {
    stream: Arc<dyn StreamClient>,
    url: RwLock<Option<String>>,
    subs: RwLock<HashMap<String, Vec<Subscriber>>>,
    // (address, bundle id) -> records collected so far, keyed by position
    pending: Mutex<HashMap<(String, String), BTreeMap<usize, Record>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    ids: AtomicU64,
}

struct Subscriber {
    id: u64,
    handler: Arc<dyn BundleHandler>,
}

/// Cancels one address subscription; `unsubscribe` is idempotent.
#[derive(Debug)]
pub struct SubscriptionHandle {
    manager: SubscriptionManager,
    address: String,
    id: u64,
    active: AtomicBool,
}

impl SubscriptionHandle {
    /// The subscribed address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Remove the handler; the connection closes when the last address is
    /// dropped. Calling this twice is a no-op.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.manager.remove(&self.address, self.id);
        }
    }
}

impl SubscriptionManager {
    /// Create a manager over a push-stream client. No connection is opened
    /// until the first subscription.
    pub fn new(stream: Arc<dyn StreamClient>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                stream,
                url: RwLock::new(None),
                subs: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                task: Mutex::new(None),
                ids: AtomicU64::new(1),
            }),
        }
    }

    /// Set the push-stream server URL used when the connection opens.
    pub fn set_server_url(&self, url: impl Into<String>) {
        *self.inner.url.write() = Some(url.into());
    }

    /// Register a handler without touching the connection. Intended for use
    /// from inside dispatch callbacks, where the connection is already open.
    pub fn register(&self, address: &str, handler: Arc<dyn BundleHandler>) -> SubscriptionHandle {
        let id = self.inner.ids.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subs
            .write()
            .entry(address.to_string())
            .or_default()
            .push(Subscriber { id, handler });
        debug!(address, id, "subscriber registered");
        SubscriptionHandle {
            manager: self.clone(),
            address: address.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Whether any subscriber listens on the address.
    pub fn is_subscribed(&self, address: &str) -> bool {
        self.inner.subs.read().contains_key(address)
    }

    /// Register a handler for an address, opening the upstream connection on
    /// first use. Fails with [`RaamError::UrlNotSet`] when no URL was set.
    pub async fn subscribe(
        &self,
        address: &str,
        handler: Arc<dyn BundleHandler>,
    ) -> Result<SubscriptionHandle, RaamError> {
        let handle = self.register(address, handler);
        if let Err(err) = self.ensure_open().await {
            handle.unsubscribe();
            return Err(err);
        }
        Ok(handle)
    }

    async fn ensure_open(&self) -> Result<(), RaamError> {
        if self.inner.task.lock().is_some() {
            return Ok(());
        }
        let url = self
            .inner
            .url
            .read()
            .clone()
            .ok_or(RaamError::UrlNotSet)?;
        let rx = self
            .inner
            .stream
            .open(&url)
            .await
            .map_err(|err| RaamError::Transport(err.to_string()))?;
        let mut task = self.inner.task.lock();
        if task.is_some() {
            // Another subscriber won the race; drop the redundant receiver.
            return Ok(());
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            drain(inner, rx).await;
        }));
        debug!(%url, "push stream opened");
        Ok(())
    }

    fn remove(&self, address: &str, id: u64) {
        let mut subs = self.inner.subs.write();
        if let Some(list) = subs.get_mut(address) {
            list.retain(|sub| sub.id != id);
            if list.is_empty() {
                subs.remove(address);
                self.inner
                    .pending
                    .lock()
                    .retain(|(addr, _), _| addr != address);
                debug!(address, "address dropped");
            }
        }
        if subs.is_empty() {
            drop(subs);
            self.close();
        }
    }

    fn close(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
            self.inner.pending.lock().clear();
            debug!("push stream closed");
        }
    }
}

async fn drain(inner: Arc<ManagerInner>, mut rx: broadcast::Receiver<Record>) {
    loop {
        match rx.recv().await {
            Ok(record) => dispatch(&inner, record),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "push stream lagged, records dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn dispatch(inner: &ManagerInner, record: Record) {
    if !inner.subs.read().contains_key(&record.address) {
        return;
    }
    let complete = {
        let mut pending = inner.pending.lock();
        let entry = pending
            .entry((record.address.clone(), record.bundle.clone()))
            .or_default();
        entry.insert(record.current_index, record.clone());
        if entry.len() == record.last_index + 1 {
            pending
                .remove(&(record.address.clone(), record.bundle.clone()))
                .map(|records| records.into_values().collect::<Vec<_>>())
        } else {
            None
        }
    };
    if let Some(records) = complete {
        debug!(address = %record.address, bundle = %record.bundle, "bundle reassembled");
        // Handlers are invoked outside the table lock; they may register or
        // unsubscribe.
        let handlers: Vec<Arc<dyn BundleHandler>> = inner
            .subs
            .read()
            .get(&record.address)
            .map(|subs| subs.iter().map(|sub| sub.handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler.on_bundle(&records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LedgerClient, MemoryTangle};
    use raam_spec::{RecordDraft, FRAG_TRYTES};
    use tokio::sync::mpsc;

    struct Collect(mpsc::UnboundedSender<Vec<Record>>);

    impl BundleHandler for Collect {
        fn on_bundle(&self, records: &[Record]) {
            let _ = self.0.send(records.to_vec());
        }
    }

    fn drafts(address: &str, count: usize) -> Vec<RecordDraft> {
        (0..count)
            .map(|i| RecordDraft {
                address: address.repeat(81),
                message: char::from(b'A' + i as u8).to_string().repeat(FRAG_TRYTES),
                tag: "9".repeat(27),
                value: 0,
            })
            .collect()
    }

    #[tokio::test]
    async fn subscription_requires_a_url() {
        let tangle = MemoryTangle::new();
        let manager = SubscriptionManager::new(Arc::new(tangle));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = manager
            .subscribe(&"A".repeat(81), Arc::new(Collect(tx)))
            .await
            .unwrap_err();
        assert_eq!(err, RaamError::UrlNotSet);
        assert!(!manager.is_subscribed(&"A".repeat(81)));
    }

    #[tokio::test]
    async fn reassembles_and_dispatches_bundles() {
        let tangle = MemoryTangle::new();
        let manager = SubscriptionManager::new(Arc::new(tangle.clone()));
        manager.set_server_url("memory://");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = manager
            .subscribe(&"A".repeat(81), Arc::new(Collect(tx)))
            .await
            .unwrap();

        tangle.submit(drafts("A", 3), 3, 14).await.unwrap();
        // A bundle at an unrelated address must not reach the handler.
        tangle.submit(drafts("B", 2), 3, 14).await.unwrap();

        let bundle = rx.recv().await.unwrap();
        assert_eq!(bundle.len(), 3);
        assert!(bundle
            .iter()
            .enumerate()
            .all(|(i, record)| record.current_index == i));
        handle.unsubscribe();
        assert!(!manager.is_subscribed(&"A".repeat(81)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let tangle = MemoryTangle::new();
        let manager = SubscriptionManager::new(Arc::new(tangle));
        manager.set_server_url("memory://");
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = manager
            .subscribe(&"C".repeat(81), Arc::new(Collect(tx)))
            .await
            .unwrap();
        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!manager.is_subscribed(&"C".repeat(81)));
    }

    #[tokio::test]
    async fn two_subscribers_share_one_address() {
        let tangle = MemoryTangle::new();
        let manager = SubscriptionManager::new(Arc::new(tangle.clone()));
        manager.set_server_url("memory://");
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let address = "D".repeat(81);
        let first = manager
            .subscribe(&address, Arc::new(Collect(tx1)))
            .await
            .unwrap();
        let second = manager
            .subscribe(&address, Arc::new(Collect(tx2)))
            .await
            .unwrap();
        tangle.submit(drafts("D", 2), 3, 14).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().len(), 2);
        assert_eq!(rx2.recv().await.unwrap().len(), 2);
        first.unsubscribe();
        assert!(manager.is_subscribed(&address));
        second.unsubscribe();
        assert!(!manager.is_subscribed(&address));
    }
}
