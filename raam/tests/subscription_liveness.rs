//! Live subscription scenarios: ordered delivery, following, clean
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use raam::{
    ChannelParams, LedgerClient, MemoryTangle, PublishOptions, Publisher, ReadObserver, Reader,
    ReaderOptions, RecordEvent, StreamClient, SubscribeOptions, SubscriptionManager,
};

const SEED: &str = "SUBSCRIPTIONSEED9SUBSCRIPTIONSEED";

struct ChannelObserver(mpsc::UnboundedSender<RecordEvent>);

impl ReadObserver for ChannelObserver {
    fn on_record(&self, event: &RecordEvent) {
        let _ = self.0.send(event.clone());
    }
}

async fn setup(height: usize) -> (MemoryTangle, Publisher, Arc<Reader>, SubscriptionManager) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let tangle = MemoryTangle::new();
    let ledger: Arc<dyn LedgerClient> = Arc::new(tangle.clone());
    let publisher = Publisher::create(SEED, ChannelParams::new(height, 1).unwrap(), ledger, None)
        .await
        .unwrap();
    let reader = Arc::new(
        Reader::new(
            &publisher.channel_root(),
            Arc::new(tangle.clone()),
            ReaderOptions {
                height: Some(height),
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let stream: Arc<dyn StreamClient> = Arc::new(tangle.clone());
    let manager = SubscriptionManager::new(stream);
    manager.set_server_url("memory://local");
    (tangle, publisher, reader, manager)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<RecordEvent>) -> RecordEvent {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event within deadline")
        .expect("observer channel open")
}

#[tokio::test]
async fn following_subscription_delivers_in_order() {
    let (_tangle, publisher, reader, manager) = setup(2).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = reader
        .clone()
        .subscribe(
            &manager,
            SubscribeOptions {
                start: Some(0),
                end: Some(0),
                following: true,
                public: false,
                message_password: None,
                observer: Arc::new(ChannelObserver(tx)),
            },
        )
        .await
        .unwrap();

    for (index, message) in ["ONE", "TWO", "THREE", "FOUR"].iter().enumerate() {
        publisher
            .publish(message, PublishOptions::default())
            .await
            .unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event.index, Some(index as u64));
        assert_eq!(event.message.as_deref(), Some(*message));
        assert!(event.error.is_none());
    }
    assert_eq!(reader.message(3).as_deref(), Some("FOUR"));
    subscription.unsubscribe();
}

#[tokio::test]
async fn range_subscription_sees_every_index() {
    let (_tangle, publisher, reader, manager) = setup(2).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = reader
        .clone()
        .subscribe(
            &manager,
            SubscribeOptions {
                start: Some(0),
                end: Some(3),
                following: false,
                public: false,
                message_password: None,
                observer: Arc::new(ChannelObserver(tx)),
            },
        )
        .await
        .unwrap();
    assert_eq!(subscription.subscribed_indexes().len(), 4);

    for message in ["ONE", "TWO", "THREE", "FOUR"] {
        publisher
            .publish(message, PublishOptions::default())
            .await
            .unwrap();
    }
    let mut seen: Vec<u64> = Vec::new();
    for _ in 0..4 {
        seen.push(next_event(&mut rx).await.index.unwrap());
    }
    assert_eq!(seen, [0, 1, 2, 3]);
    subscription.unsubscribe();
}

#[tokio::test]
async fn unsubscribe_cancels_remaining_deliveries() {
    let (_tangle, publisher, reader, manager) = setup(2).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = reader
        .clone()
        .subscribe(
            &manager,
            SubscribeOptions {
                start: Some(0),
                end: Some(3),
                following: false,
                public: false,
                message_password: None,
                observer: Arc::new(ChannelObserver(tx)),
            },
        )
        .await
        .unwrap();

    publisher.publish("ONE", PublishOptions::default()).await.unwrap();
    publisher.publish("TWO", PublishOptions::default()).await.unwrap();
    assert_eq!(next_event(&mut rx).await.index, Some(0));
    assert_eq!(next_event(&mut rx).await.index, Some(1));

    // Dropping every address closes the upstream connection, so later
    // publishes cannot reach the observer at all.
    subscription.unsubscribe();
    subscription.unsubscribe();
    publisher.publish("THREE", PublishOptions::default()).await.unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(reader.message(2), None);
}

#[tokio::test]
async fn public_subscription_decrypts_by_address() {
    let (_tangle, publisher, reader, manager) = setup(1).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = reader
        .clone()
        .subscribe(
            &manager,
            SubscribeOptions {
                start: Some(0),
                end: Some(0),
                following: false,
                public: true,
                message_password: None,
                observer: Arc::new(ChannelObserver(tx)),
            },
        )
        .await
        .unwrap();

    publisher
        .publish(
            "OPEN",
            PublishOptions {
                public: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!(event.message.as_deref(), Some("OPEN"));
    assert_eq!(
        event.channel_root.as_deref(),
        Some(publisher.channel_root().as_str())
    );
    subscription.unsubscribe();
}
