//! Channel reader: per-index cache, hole-coalescing range fetches,
//! verification, live subscriptions, and the stateless fetch helpers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use raam_client::{BundleHandler, LedgerClient, SubscriptionManager};
use raam_codec::{self as codec, ParseExpectations, ParsedMessage};
use raam_spec::{
    validate_height, validate_message, RaamError, Record, ADDRESS_TRYTES, MAX_SECURITY,
};
use raam_ternary::{trits_from_trytes, trytes_from_trits, Trit};

use crate::observer::{ReadObserver, RecordEvent, SkippedBundle};

/// Construction parameters for a channel reader.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Channel height, when known; learned from the first parsed header
    /// otherwise.
    pub height: Option<usize>,
    /// Channel password the publisher used, if any.
    pub channel_password: Option<String>,
}

/// One-shot fetch configuration.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Fetch exactly this index.
    pub index: Option<u64>,
    /// First index of a range walk; defaults to 0.
    pub start: Option<u64>,
    /// Last index of a range walk; `None` probes until the first address
    /// with no bundles.
    pub end: Option<u64>,
    /// Per-message password for decryption.
    pub message_password: Option<String>,
    /// Optional per-index observer.
    pub observer: Option<Arc<dyn ReadObserver>>,
}

/// Live subscription configuration.
#[derive(Clone)]
pub struct SubscribeOptions {
    /// First index to subscribe; defaults to 0.
    pub start: Option<u64>,
    /// Last index to subscribe; defaults to the start index.
    pub end: Option<u64>,
    /// Transparently subscribe index `i + 1` once index `i` arrives.
    pub following: bool,
    /// Decrypt with the address-derived public key instead of channel keys.
    pub public: bool,
    /// Per-message password for decryption.
    pub message_password: Option<String>,
    /// Receives one event per verified or failed delivery.
    pub observer: Arc<dyn ReadObserver>,
}

/// Outcome of a fetch or sync walk over a range of indexes.
#[derive(Debug, Default)]
pub struct FetchResult {
    /// Every cached message inside the walked range, including prior hits.
    pub messages: BTreeMap<u64, String>,
    /// Branch roots inside the walked range.
    pub branches: BTreeMap<u64, String>,
    /// Per-index bundles that failed to parse.
    pub skipped: BTreeMap<u64, Vec<SkippedBundle>>,
    /// Per-index verification failures.
    pub errors: BTreeMap<u64, RaamError>,
}

/// A verifying reader of one RAAM channel.
pub struct Reader {
    root_trytes: String,
    root: Vec<Trit>,
    security: usize,
    height: Option<usize>,
    channel_password: Option<String>,
    client: Arc<dyn LedgerClient>,
    state: RwLock<Cache>,
}

#[derive(Default)]
struct Cache {
    messages: BTreeMap<u64, String>,
    branches: BTreeMap<u64, String>,
    cursor: u64,
}

struct IndexFetch {
    parsed: Option<ParsedMessage>,
    computed_root: Option<Vec<Trit>>,
    error: Option<RaamError>,
    skipped: Vec<SkippedBundle>,
    found_bundles: bool,
}

impl Reader {
    /// Build a reader from a channel root. The security level is implied by
    /// the root width.
    pub fn new(
        root: &str,
        client: Arc<dyn LedgerClient>,
        options: ReaderOptions,
    ) -> Result<Self, RaamError> {
        validate_message(root)?;
        let grams = root.len() / ADDRESS_TRYTES;
        if root.is_empty() || root.len() % ADDRESS_TRYTES != 0 || grams > MAX_SECURITY {
            return Err(RaamError::InvalidSecurityLevel(grams));
        }
        if let Some(height) = options.height {
            validate_height(height)?;
        }
        if let Some(password) = &options.channel_password {
            validate_message(password)?;
        }
        Ok(Self {
            root_trytes: root.to_string(),
            root: trits_from_trytes(root)?,
            security: grams,
            height: options.height,
            channel_password: options.channel_password,
            client,
            state: RwLock::new(Cache::default()),
        })
    }

    /// The channel root as trytes.
    pub fn channel_root(&self) -> &str {
        &self.root_trytes
    }

    /// The security level implied by the root width.
    pub fn security(&self) -> usize {
        self.security
    }

    /// The first index not yet known to hold a message.
    pub fn cursor(&self) -> u64 {
        self.state.read().cursor
    }

    /// A cached message, if the index was fetched before.
    pub fn message(&self, index: u64) -> Option<String> {
        self.state.read().messages.get(&index).cloned()
    }

    /// A cached branch root, if the index carries one.
    pub fn branch(&self, index: u64) -> Option<String> {
        self.state.read().branches.get(&index).cloned()
    }

    fn is_cached(&self, index: u64) -> bool {
        self.state.read().messages.contains_key(&index)
    }

    fn capacity_bound(&self) -> Option<u64> {
        self.height.map(|height| 1u64 << height)
    }

    /// Fetch a single index or a range; holes in the cache are queried, and
    /// cached entries are never touched again.
    pub async fn fetch(&self, options: FetchOptions) -> Result<FetchResult, RaamError> {
        let (start, end) = match options.index {
            Some(index) => (index, Some(index)),
            None => (options.start.unwrap_or(0), options.end),
        };
        self.walk(
            start,
            end,
            options.message_password.as_deref(),
            options.observer.as_ref(),
        )
        .await
    }

    /// Probe forward until the first address with no bundles, then set the
    /// cursor there.
    pub async fn sync_channel(&self, options: FetchOptions) -> Result<FetchResult, RaamError> {
        self.walk(
            options.start.unwrap_or(0),
            None,
            options.message_password.as_deref(),
            options.observer.as_ref(),
        )
        .await
    }

    async fn walk(
        &self,
        start: u64,
        end: Option<u64>,
        message_password: Option<&str>,
        observer: Option<&Arc<dyn ReadObserver>>,
    ) -> Result<FetchResult, RaamError> {
        let mut result = FetchResult::default();
        let mut bound = self.capacity_bound();
        let mut index = start;
        loop {
            if let Some(end) = end {
                if index > end {
                    break;
                }
            }
            if let Some(bound) = bound {
                if index >= bound {
                    if end.is_none() {
                        self.advance_cursor(index);
                    }
                    break;
                }
            }
            if self.is_cached(index) {
                index += 1;
                continue;
            }
            let outcome = self.fetch_index(index, message_password, false).await?;
            if !outcome.found_bundles {
                if end.is_none() {
                    self.advance_cursor(index);
                    break;
                }
                index += 1;
                continue;
            }
            if !outcome.skipped.is_empty() {
                result.skipped.insert(index, outcome.skipped.clone());
            }
            if let Some(parsed) = &outcome.parsed {
                if bound.is_none() {
                    bound = Some(1u64 << parsed.height);
                }
                self.cache_insert(index, parsed);
            } else if let Some(error) = &outcome.error {
                warn!(index, %error, "message rejected");
                result.errors.insert(index, error.clone());
            }
            if let Some(observer) = observer {
                observer.on_record(&self.event_of(index, &outcome));
            }
            index += 1;
        }

        let upper = end.unwrap_or(index);
        let state = self.state.read();
        for (i, message) in state.messages.range(start..=upper) {
            result.messages.insert(*i, message.clone());
        }
        for (i, root) in state.branches.range(start..=upper) {
            result.branches.insert(*i, root.clone());
        }
        Ok(result)
    }

    fn advance_cursor(&self, hole: u64) {
        let mut state = self.state.write();
        state.cursor = state.cursor.max(hole);
    }

    fn cache_insert(&self, index: u64, parsed: &ParsedMessage) {
        let mut state = self.state.write();
        state
            .messages
            .entry(index)
            .or_insert_with(|| parsed.message.clone());
        if let Some(next_root) = &parsed.next_root {
            state
                .branches
                .entry(index)
                .or_insert_with(|| next_root.clone());
        }
        debug!(index, "message cached");
    }

    fn event_of(&self, index: u64, outcome: &IndexFetch) -> RecordEvent {
        RecordEvent {
            index: Some(index),
            message: outcome.parsed.as_ref().map(|p| p.message.clone()),
            next_root: outcome.parsed.as_ref().and_then(|p| p.next_root.clone()),
            channel_root: outcome
                .computed_root
                .as_ref()
                .map(|root| trytes_from_trits(root)),
            skipped: outcome.skipped.clone(),
            error: outcome.error.clone(),
        }
    }

    async fn fetch_index(
        &self,
        index: u64,
        message_password: Option<&str>,
        public: bool,
    ) -> Result<IndexFetch, RaamError> {
        let address = codec::address(&self.root, index, self.channel_password.as_deref())?;
        let bundles = self
            .client
            .find_by_address(&address)
            .await
            .map_err(|err| RaamError::Transport(err.to_string()))?;
        if bundles.is_empty() {
            return Ok(IndexFetch {
                parsed: None,
                computed_root: None,
                error: None,
                skipped: Vec::new(),
                found_bundles: false,
            });
        }
        let records = self
            .client
            .get_records(&bundles)
            .await
            .map_err(|err| RaamError::Transport(err.to_string()))?;
        let key = self.cipher_key(&address, index, message_password, public)?;
        let expect = ParseExpectations {
            index: Some(index),
            height: self.height,
            security: Some(self.security),
        };
        Ok(try_bundles(
            group_records(&bundles, records),
            &key,
            &expect,
            Some(&self.root),
        ))
    }

    fn cipher_key(
        &self,
        address: &str,
        index: u64,
        message_password: Option<&str>,
        public: bool,
    ) -> Result<Vec<Trit>, RaamError> {
        if public {
            // Public messages encrypt under the address itself.
            Ok(trits_from_trytes(address)?)
        } else {
            codec::message_key(
                &self.root,
                index,
                self.channel_password.as_deref(),
                message_password,
            )
        }
    }

    /// Subscribe to a range of indexes through the given manager; arriving
    /// bundles are parsed and verified exactly like fetched ones. Call as
    /// `reader.clone().subscribe(..)` on an `Arc<Reader>`.
    pub async fn subscribe(
        self: Arc<Self>,
        manager: &SubscriptionManager,
        options: SubscribeOptions,
    ) -> Result<ReaderSubscription, RaamError> {
        let shared = Arc::new(SubscriptionShared {
            reader: self.clone(),
            manager: manager.clone(),
            following: options.following,
            public: options.public,
            message_password: options.message_password.clone(),
            observer: options.observer.clone(),
            handles: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
        });
        let subscription = ReaderSubscription {
            shared: shared.clone(),
        };
        let start = options.start.unwrap_or(0);
        let end = options.end.unwrap_or(start);
        for index in start..=end {
            if self.is_cached(index) {
                continue;
            }
            let address = codec::address(&self.root, index, self.channel_password.as_deref())?;
            let handler = Arc::new(IndexHandler {
                shared: shared.clone(),
                index,
            });
            match manager.subscribe(&address, handler).await {
                Ok(handle) => {
                    shared.handles.lock().insert(index, handle);
                }
                Err(err) => {
                    subscription.unsubscribe();
                    return Err(err);
                }
            }
        }
        Ok(subscription)
    }
}

/// Cancels every per-index subscription a [`Reader::subscribe`] call opened.
pub struct ReaderSubscription {
    shared: Arc<SubscriptionShared>,
}

struct SubscriptionShared {
    reader: Arc<Reader>,
    manager: SubscriptionManager,
    following: bool,
    public: bool,
    message_password: Option<String>,
    observer: Arc<dyn ReadObserver>,
    handles: Mutex<HashMap<u64, raam_client::SubscriptionHandle>>,
    active: AtomicBool,
}

impl ReaderSubscription {
    /// The indexes currently subscribed.
    pub fn subscribed_indexes(&self) -> Vec<u64> {
        self.shared.handles.lock().keys().copied().collect()
    }

    /// Cancel every member subscription; idempotent.
    pub fn unsubscribe(&self) {
        if self.shared.active.swap(false, Ordering::SeqCst) {
            for (_, handle) in self.shared.handles.lock().drain() {
                handle.unsubscribe();
            }
        }
    }
}

struct IndexHandler {
    shared: Arc<SubscriptionShared>,
    index: u64,
}

impl BundleHandler for IndexHandler {
    fn on_bundle(&self, records: &[Record]) {
        let shared = &self.shared;
        if !shared.active.load(Ordering::SeqCst) {
            return;
        }
        let reader = &shared.reader;
        if reader.is_cached(self.index) {
            return;
        }
        let outcome = match self.process(records) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(index = self.index, %err, "subscription delivery failed");
                return;
            }
        };
        if let Some(parsed) = &outcome.parsed {
            reader.cache_insert(self.index, parsed);
        }
        // Register the follow-up before notifying, so an observer reacting
        // to this event cannot outrun the next subscription.
        if outcome.parsed.is_some() && shared.following {
            self.follow(self.index + 1);
        }
        shared
            .observer
            .on_record(&reader.event_of(self.index, &outcome));
    }
}

impl IndexHandler {
    fn process(&self, records: &[Record]) -> Result<IndexFetch, RaamError> {
        let shared = &self.shared;
        let reader = &shared.reader;
        let address = codec::address(
            &reader.root,
            self.index,
            reader.channel_password.as_deref(),
        )?;
        let key = reader.cipher_key(
            &address,
            self.index,
            shared.message_password.as_deref(),
            shared.public,
        )?;
        let expect = ParseExpectations {
            index: Some(self.index),
            height: reader.height,
            security: Some(reader.security),
        };
        let bundle = records
            .first()
            .map(|record| record.bundle.clone())
            .unwrap_or_default();
        Ok(try_bundles(
            vec![(bundle, records.to_vec())],
            &key,
            &expect,
            Some(&reader.root),
        ))
    }

    fn follow(&self, next: u64) {
        let shared = &self.shared;
        if !shared.active.load(Ordering::SeqCst) {
            return;
        }
        let reader = &shared.reader;
        if let Some(bound) = reader.capacity_bound() {
            if next >= bound {
                return;
            }
        }
        if reader.is_cached(next) {
            return;
        }
        let mut handles = shared.handles.lock();
        if handles.contains_key(&next) {
            return;
        }
        match codec::address(&reader.root, next, reader.channel_password.as_deref()) {
            Ok(address) => {
                let handler = Arc::new(IndexHandler {
                    shared: shared.clone(),
                    index: next,
                });
                // The connection is already open; register without awaiting.
                let handle = shared.manager.register(&address, handler);
                handles.insert(next, handle);
                debug!(index = next, "following subscription added");
            }
            Err(err) => warn!(index = next, %err, "cannot derive follow address"),
        }
    }
}

fn group_records(bundles: &[String], records: Vec<Record>) -> Vec<(String, Vec<Record>)> {
    let mut by_bundle: HashMap<String, Vec<Record>> = HashMap::new();
    for record in records {
        by_bundle
            .entry(record.bundle.clone())
            .or_default()
            .push(record);
    }
    bundles
        .iter()
        .filter_map(|bundle| {
            by_bundle
                .remove(bundle)
                .map(|records| (bundle.clone(), records))
        })
        .collect()
}

fn try_bundles(
    grouped: Vec<(String, Vec<Record>)>,
    key: &[Trit],
    expect: &ParseExpectations,
    expected_root: Option<&[Trit]>,
) -> IndexFetch {
    let mut skipped = Vec::new();
    for (bundle, records) in grouped {
        match codec::parse(&records, key, expect) {
            // The first bundle that parses wins; its verification outcome is
            // final for this index.
            Ok(parsed) => {
                return match codec::authenticate(&parsed, expected_root) {
                    Ok(root) => IndexFetch {
                        parsed: Some(parsed),
                        computed_root: Some(root),
                        error: None,
                        skipped,
                        found_bundles: true,
                    },
                    Err(error) => IndexFetch {
                        parsed: None,
                        computed_root: None,
                        error: Some(error),
                        skipped,
                        found_bundles: true,
                    },
                };
            }
            Err(reason) => {
                debug!(%bundle, %reason, "bundle skipped");
                skipped.push(SkippedBundle { bundle, reason });
            }
        }
    }
    IndexFetch {
        parsed: None,
        computed_root: None,
        error: None,
        skipped,
        found_bundles: true,
    }
}

/// Options shared by the stateless fetch helpers.
#[derive(Debug, Clone, Default)]
pub struct SingleOptions {
    /// Channel height, when known.
    pub height: Option<usize>,
    /// Channel password, if the publisher used one.
    pub channel_password: Option<String>,
    /// Per-message password.
    pub message_password: Option<String>,
}

/// Fetch and verify one index of a channel without keeping a reader.
pub async fn fetch_single(
    client: &Arc<dyn LedgerClient>,
    root: &str,
    index: u64,
    options: &SingleOptions,
) -> Result<RecordEvent, RaamError> {
    let reader = Reader::new(
        root,
        client.clone(),
        ReaderOptions {
            height: options.height,
            channel_password: options.channel_password.clone(),
        },
    )?;
    let outcome = reader
        .fetch_index(index, options.message_password.as_deref(), false)
        .await?;
    Ok(reader.event_of(index, &outcome))
}

/// Fetch a range of indexes without keeping a reader.
pub async fn fetch_range(
    client: &Arc<dyn LedgerClient>,
    root: &str,
    start: u64,
    end: Option<u64>,
    options: &SingleOptions,
) -> Result<FetchResult, RaamError> {
    let reader = Reader::new(
        root,
        client.clone(),
        ReaderOptions {
            height: options.height,
            channel_password: options.channel_password.clone(),
        },
    )?;
    reader
        .walk(start, end, options.message_password.as_deref(), None)
        .await
}

/// Fetch a public-mode message knowing only its ledger address. The channel
/// root is recovered from the Merkle path and returned in the event.
pub async fn fetch_public(
    client: &Arc<dyn LedgerClient>,
    address: &str,
) -> Result<RecordEvent, RaamError> {
    validate_message(address)?;
    let bundles = client
        .find_by_address(address)
        .await
        .map_err(|err| RaamError::Transport(err.to_string()))?;
    if bundles.is_empty() {
        return Ok(RecordEvent::default());
    }
    let records = client
        .get_records(&bundles)
        .await
        .map_err(|err| RaamError::Transport(err.to_string()))?;
    let key = trits_from_trytes(address)?;
    let outcome = try_bundles(
        group_records(&bundles, records),
        &key,
        &ParseExpectations::default(),
        None,
    );
    let mut event = RecordEvent {
        index: outcome.parsed.as_ref().map(|p| p.index),
        message: outcome.parsed.as_ref().map(|p| p.message.clone()),
        next_root: outcome.parsed.as_ref().and_then(|p| p.next_root.clone()),
        channel_root: outcome
            .computed_root
            .as_ref()
            .map(|root| trytes_from_trits(root)),
        skipped: outcome.skipped,
        error: outcome.error,
    };
    if let Some(error) = event.error.take() {
        return Err(error);
    }
    Ok(event)
}

/// Fetch many public-mode messages concurrently; one result per address.
pub async fn fetch_public_messages(
    client: &Arc<dyn LedgerClient>,
    addresses: &[String],
) -> HashMap<String, Result<RecordEvent, RaamError>> {
    let lookups = addresses
        .iter()
        .map(|address| fetch_public(client, address));
    let results = futures::future::join_all(lookups).await;
    addresses.iter().cloned().zip(results).collect()
}
