use liaison::prelude::*;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn context(name: &str, id: i32) -> ZmqContext {
    liaison::dev_tracing::init_tracing();
    let base = portpicker::pick_unused_port().expect("free port");
    let app = AppIdentity::new(name, id, Endpoint::tcp("127.0.0.1", 0).unwrap());
    let options = ProtocolOptions::new()
        .with_polling_interval(Duration::from_millis(20))
        .with_sync_timeout_step(Duration::from_millis(50));
    ZmqContext::new(
        AppContext::new(app, Services::local(base..=base.saturating_add(300))).with_options(options),
    )
}

#[test]
fn test_no_subscriber_expected() {
    let ctx = context("lonely", 1);
    let mut publisher = Publisher::create(&ctx, "ticks", 0).unwrap();
    assert_eq!(publisher.ports().synchronizer_port, 0);
    assert!(publisher.wait_for_subscribers().unwrap());
    publisher.send_string("nobody listens").unwrap();
    publisher.send_end().unwrap();
    assert!(publisher.has_ended());
}

#[test]
fn test_every_subscriber_gets_the_whole_stream() {
    let ctx = context("broadcaster", 2);
    let peer = PeerApp::from(ctx.identity());
    let mut publisher = Publisher::create(&ctx, "positions", 3).unwrap();

    let subscribers: Vec<_> = (0..3)
        .map(|_| {
            let ctx = ctx.clone();
            let peer = peer.clone();
            thread::spawn(move || {
                let mut subscriber = Subscriber::create(&ctx, &peer, "positions").unwrap();
                let mut received = Vec::new();
                while let Some(position) = subscriber.receive_string().unwrap() {
                    received.push(position);
                }
                assert!(subscriber.has_ended());
                assert!(!subscriber.is_canceled());
                received
            })
        })
        .collect();

    assert!(publisher.wait_for_subscribers().unwrap());
    for i in 0..10 {
        publisher.send_string(&format!("position {}", i)).unwrap();
    }
    publisher.send_two_parts(b"x", b"y").unwrap();
    publisher.send_end().unwrap();

    let expected: Vec<String> = (0..10)
        .map(|i| format!("position {}", i))
        .chain(std::iter::once("x".to_string()))
        .collect();
    for subscriber in subscribers {
        assert_eq!(subscriber.join().unwrap(), expected);
    }
}

#[test]
fn test_cancel_wait_after_first_subscriber() {
    let ctx = context("impatient", 3);
    let peer = PeerApp::from(ctx.identity());
    let mut publisher = Publisher::create(&ctx, "partial", 3).unwrap();
    let canceler = publisher.canceler();

    let (joined_tx, joined_rx) = mpsc::channel();
    let subscriber = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            let mut subscriber = Subscriber::create(&ctx, &peer, "partial").unwrap();
            joined_tx.send(()).unwrap();
            assert_eq!(subscriber.receive().unwrap(), None);
            subscriber.has_ended()
        })
    };
    let cancel = thread::spawn(move || {
        joined_rx.recv().unwrap();
        canceler.cancel().unwrap();
    });

    assert!(!publisher.wait_for_subscribers().unwrap());
    assert!(publisher.is_canceled());
    cancel.join().unwrap();

    // Terminating sends the end of stream the application never sent.
    publisher.terminate();
    assert!(subscriber.join().unwrap());
}

#[test]
fn test_subscriber_cancel_from_another_thread() {
    let ctx = context("quiet", 4);
    let peer = PeerApp::from(ctx.identity());
    let _publisher = Publisher::create(&ctx, "silence", 0).unwrap();

    let mut subscriber = Subscriber::create(&ctx, &peer, "silence").unwrap();
    let canceler = subscriber.canceler();
    let cancel = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceler.cancel().unwrap();
        canceler.cancel().unwrap();
    });
    assert_eq!(subscriber.receive().unwrap(), None);
    assert!(subscriber.is_canceled());
    assert!(!subscriber.has_ended());
    cancel.join().unwrap();
}

#[test]
fn test_unknown_publisher() {
    let ctx = context("lost", 5);
    let peer = PeerApp::from(ctx.identity());
    let err = Subscriber::create(&ctx, &peer, "missing").unwrap_err();
    assert!(matches!(err, LiaisonError::Registry(_)));
}

#[test]
fn test_duplicate_publisher_name() {
    let ctx = context("twins", 6);
    let first = Publisher::create(&ctx, "same", 1).unwrap();
    let err = Publisher::create(&ctx, "same", 1).unwrap_err();
    assert!(err.is_naming_conflict());
    assert_eq!(first.name(), "same");
}
