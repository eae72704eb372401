//! In-process tangle: a shared record store with broadcast notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use raam_spec::{Record, RecordDraft};
use raam_ternary::{trits_from_trytes, trytes_from_trits, Curl, HASH_LENGTH};

use crate::{ClientResult, LedgerClient, StreamClient};

/// An in-memory ledger implementing both client interfaces. Cloning yields
/// another handle onto the same tangle, so publishers and readers in one
/// process observe each other.
#[derive(Clone)]
pub struct MemoryTangle {
    inner: Arc<Inner>,
}

struct Inner {
    bundles: RwLock<HashMap<String, Vec<Record>>>,
    // address -> [(timestamp, bundle id)]
    by_address: RwLock<HashMap<String, Vec<(u64, String)>>>,
    stream: broadcast::Sender<Record>,
    clock: AtomicU64,
}

impl Default for MemoryTangle {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTangle {
    /// Create an empty tangle.
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                bundles: RwLock::new(HashMap::new()),
                by_address: RwLock::new(HashMap::new()),
                stream,
                clock: AtomicU64::new(1),
            }),
        }
    }

    /// Number of bundles stored.
    pub fn bundle_count(&self) -> usize {
        self.inner.bundles.read().len()
    }
}

fn bundle_id(drafts: &[RecordDraft]) -> ClientResult<String> {
    let mut curl = Curl::new();
    for draft in drafts {
        curl.absorb(&trits_from_trytes(&draft.address).map_err(anyhow::Error::from)?);
        curl.absorb(&trits_from_trytes(&draft.message).map_err(anyhow::Error::from)?);
    }
    Ok(trytes_from_trits(&curl.squeeze(HASH_LENGTH)))
}

#[async_trait]
impl LedgerClient for MemoryTangle {
    async fn find_by_address(&self, address: &str) -> ClientResult<Vec<String>> {
        let by_address = self.inner.by_address.read();
        let mut entries = by_address.get(address).cloned().unwrap_or_default();
        entries.sort_by_key(|(timestamp, _)| *timestamp);
        Ok(entries.into_iter().map(|(_, bundle)| bundle).collect())
    }

    async fn get_records(&self, bundles: &[String]) -> ClientResult<Vec<Record>> {
        let store = self.inner.bundles.read();
        Ok(bundles
            .iter()
            .filter_map(|bundle| store.get(bundle))
            .flatten()
            .cloned()
            .collect())
    }

    async fn submit(
        &self,
        drafts: Vec<RecordDraft>,
        _depth: u8,
        _mwm: u8,
    ) -> ClientResult<Vec<Record>> {
        anyhow::ensure!(!drafts.is_empty(), "cannot attach an empty bundle");
        let bundle = bundle_id(&drafts)?;
        let timestamp = self.inner.clock.fetch_add(1, Ordering::SeqCst);
        let last_index = drafts.len() - 1;
        let records: Vec<Record> = drafts
            .into_iter()
            .enumerate()
            .map(|(current_index, draft)| Record {
                address: draft.address,
                bundle: bundle.clone(),
                current_index,
                last_index,
                message: draft.message,
                tag: draft.tag,
                timestamp,
            })
            .collect();
        {
            let mut by_address = self.inner.by_address.write();
            for record in &records {
                let entry = by_address.entry(record.address.clone()).or_default();
                if !entry.iter().any(|(_, b)| *b == bundle) {
                    entry.push((timestamp, bundle.clone()));
                }
            }
        }
        self.inner
            .bundles
            .write()
            .insert(bundle.clone(), records.clone());
        debug!(%bundle, records = records.len(), "bundle attached");
        for record in &records {
            // Nobody listening is fine; the stream is best effort.
            let _ = self.inner.stream.send(record.clone());
        }
        Ok(records)
    }
}

#[async_trait]
impl StreamClient for MemoryTangle {
    async fn open(&self, _url: &str) -> ClientResult<broadcast::Receiver<Record>> {
        Ok(self.inner.stream.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raam_spec::FRAG_TRYTES;

    fn draft(address: &str, fill: char) -> RecordDraft {
        RecordDraft {
            address: address.repeat(81),
            message: fill.to_string().repeat(FRAG_TRYTES),
            tag: "9".repeat(27),
            value: 0,
        }
    }

    #[tokio::test]
    async fn submit_then_find_and_fetch() {
        let tangle = MemoryTangle::new();
        let records = tangle
            .submit(vec![draft("A", 'X'), draft("A", 'Y')], 3, 14)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].current_index, 0);
        assert_eq!(records[1].last_index, 1);

        let bundles = tangle.find_by_address(&"A".repeat(81)).await.unwrap();
        assert_eq!(bundles.len(), 1);
        let fetched = tangle.get_records(&bundles).await.unwrap();
        assert_eq!(fetched, records);
        assert!(tangle
            .find_by_address(&"B".repeat(81))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn bundles_at_one_address_keep_attachment_order() {
        let tangle = MemoryTangle::new();
        let first = tangle
            .submit(vec![draft("A", 'X'), draft("A", 'Y')], 3, 14)
            .await
            .unwrap();
        let second = tangle
            .submit(vec![draft("A", 'Z'), draft("A", 'W')], 3, 14)
            .await
            .unwrap();
        let bundles = tangle.find_by_address(&"A".repeat(81)).await.unwrap();
        assert_eq!(bundles, vec![
            first[0].bundle.clone(),
            second[0].bundle.clone()
        ]);
    }

    #[tokio::test]
    async fn stream_delivers_submitted_records() {
        let tangle = MemoryTangle::new();
        let mut rx = tangle.open("memory://").await.unwrap();
        tangle
            .submit(vec![draft("C", 'X'), draft("C", 'Y')], 3, 14)
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.current_index, 0);
        assert_eq!(second.current_index, 1);
        assert_eq!(first.bundle, second.bundle);
    }
}
