//! End-to-end scenarios against an in-memory log, exercising
//! `MailboxService` the way a real two-agent conversation would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mailbox_core::config::MailboxConfig;
use mailbox_core::dispatch::Handler;
use mailbox_core::message::MailboxMessage;
use mailbox_core::service::MailboxService;
use mailbox_core::stream_log::fake::FakeStreamLog;
use mailbox_core::StreamLog;
use serde_json::{Map, Value};

fn fast_config() -> MailboxConfig {
    MailboxConfig {
        poll_interval_secs: 0.01,
        ..MailboxConfig::default()
    }
}

fn recording_handler() -> (Handler, Arc<std::sync::Mutex<Vec<MailboxMessage>>>) {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let handler: Handler = Arc::new(move |message| {
        let seen2 = seen2.clone();
        Box::pin(async move {
            seen2.lock().unwrap().push(message);
            Ok(())
        })
    });
    (handler, seen)
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S1 — basic send/receive: a message sent to bob's inbox is dispatched
/// to bob's handler within a few poll intervals. `send_message` shares
/// the running service's own connection, so a service can address
/// itself to stand in for a second process pointed at the same log.
#[tokio::test]
async fn s1_basic_send_receive() {
    let mut bob = MailboxService::with_log("bob", fast_config(), Box::new(FakeStreamLog::new()));

    let (handler, seen) = recording_handler();
    bob.register_handler(handler);
    bob.start().await.expect("bob should start");

    let mut payload = Map::new();
    payload.insert("n".to_string(), Value::from(1));
    bob.send_message("bob", payload, None, None)
        .await
        .expect("send to self should succeed");

    wait_until(|| !seen.lock().unwrap().is_empty()).await;

    let received = seen.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload.get("n"), Some(&Value::from(1)));

    drop(received);
    bob.stop().await;
}

/// S2 — recovery of an orphaned entry: a message force-delivered to a
/// throwaway consumer (simulating a crashed prior incarnation) is
/// picked up by the next `start()` and acked.
#[tokio::test]
async fn s2_recovery_of_orphan() {
    let mut log = FakeStreamLog::new();
    log.xgroup_create("beast:mailbox:bob:in", "bob:group").await.ok();
    log.seed(
        "beast:mailbox:bob:in",
        vec![
            ("sender".into(), "alice".into()),
            ("recipient".into(), "bob".into()),
            ("payload".into(), "{\"n\":2}".into()),
        ],
    );
    log.force_deliver_one("beast:mailbox:bob:in", "bob:group", "bob:stale");

    let mut bob = MailboxService::with_log("bob", fast_config(), Box::new(log));
    let (handler, seen) = recording_handler();
    bob.register_handler(handler);
    bob.start().await.expect("bob should start and recover");

    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    bob.stop().await;
}

/// S3 — handler crash isolation: a poison handler that always errors
/// does not stop a second handler from seeing the message.
#[tokio::test]
async fn s3_handler_crash_isolation() {
    let mut bob = MailboxService::with_log("bob", fast_config(), Box::new(FakeStreamLog::new()));

    let poison: Handler = Arc::new(|_msg| Box::pin(async move { anyhow::bail!("poison handler") }));
    let (ok_handler, seen) = recording_handler();

    bob.register_handler(poison);
    bob.register_handler(ok_handler);
    bob.start().await.expect("bob should start");

    let mut payload = Map::new();
    payload.insert("k".to_string(), Value::from("v"));
    bob.send_message("bob", payload, None, None).await.expect("send should succeed");

    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    bob.stop().await;
}

/// S5 — configurable recovery batch size: five pending entries recover
/// completely regardless of how small the claim batch is.
#[tokio::test]
async fn s5_configurable_batch_recovers_everything() {
    let mut log = FakeStreamLog::new();
    log.xgroup_create("beast:mailbox:carol:in", "carol:group").await.ok();
    for i in 0..5 {
        log.seed("beast:mailbox:carol:in", vec![("payload".into(), format!("{{\"i\":{i}}}"))]);
    }
    for _ in 0..5 {
        log.force_deliver_one("beast:mailbox:carol:in", "carol:group", "carol:stale");
    }

    let config = MailboxConfig {
        poll_interval_secs: 0.01,
        recovery_batch_size: 2,
        ..MailboxConfig::default()
    };
    let mut carol = MailboxService::with_log("carol", config, Box::new(log));
    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = counter.clone();
    carol.register_handler(Arc::new(move |_msg| {
        let counter2 = counter2.clone();
        Box::pin(async move {
            counter2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }));

    carol.start().await.expect("carol should start and recover all five");
    wait_until(|| counter.load(Ordering::SeqCst) == 5).await;
    assert_eq!(counter.load(Ordering::SeqCst), 5);

    carol.stop().await;
}

/// S6 — disabled recovery still fires the callback, with zero
/// messages recovered.
#[tokio::test]
async fn s6_disabled_recovery_still_fires_callback() {
    let config = MailboxConfig {
        enable_recovery: false,
        ..fast_config()
    };
    let mut dave = MailboxService::with_log("dave", config, Box::new(FakeStreamLog::new()));
    dave.register_handler(Arc::new(|_msg| Box::pin(async move { Ok(()) })));

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked2 = invoked.clone();
    dave.set_recovery_callback(Box::new(move |metrics| {
        let invoked2 = invoked2.clone();
        Box::pin(async move {
            assert_eq!(metrics.total_recovered, 0);
            invoked2.fetch_add(1, Ordering::SeqCst);
        })
    }));

    dave.start().await.expect("dave should start with recovery disabled");
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    dave.stop().await;
}
