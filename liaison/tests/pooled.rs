use liaison::prelude::*;
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
fn test_requests_spread_over_workers() {
    let ctx = context("pool-app", 20);
    let peer = PeerApp::from(ctx.identity());
    let mut router = ResponderRouter::create(&ctx, "upper").unwrap();
    let router_cancel = router.canceler();

    let mut worker_cancels = Vec::new();
    let mut workers = Vec::new();
    for worker_id in 0..2 {
        let mut worker = PooledResponder::create(&ctx, router.internal_endpoint()).unwrap();
        worker_cancels.push(worker.canceler());
        workers.push(thread::spawn(move || {
            let mut served = 0;
            while let Some(request) = worker.receive().unwrap() {
                let answer = request.get_string().to_uppercase();
                request
                    .reply_two_parts(answer.as_bytes(), worker_id.to_string().as_bytes())
                    .unwrap();
                served += 1;
            }
            assert!(worker.is_canceled());
            served
        }));
    }
    let relaying = thread::spawn(move || {
        router.run().unwrap();
        router.is_canceled()
    });

    let clients: Vec<_> = (0..4)
        .map(|i| {
            let ctx = ctx.clone();
            let peer = peer.clone();
            thread::spawn(move || {
                let mut requester = Requester::create(&ctx, &peer, "upper").unwrap();
                let text = format!("request {}", i);
                requester.send_string(&text).unwrap();
                let (answer, worker) = requester.receive_two_parts().unwrap().unwrap();
                assert_eq!(&answer[..], text.to_uppercase().as_bytes());
                assert!(&worker[..] == b"0" || &worker[..] == b"1");
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    for cancel in &worker_cancels {
        cancel.cancel().unwrap();
    }
    let served: i32 = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(served, 4);

    router_cancel.cancel().unwrap();
    assert!(relaying.join().unwrap());
}

#[test]
fn test_relay_preserves_binary_frames() {
    let ctx = context("binary-app", 21);
    let peer = PeerApp::from(ctx.identity());
    let mut router = ResponderRouter::create(&ctx, "bytes").unwrap();
    let router_cancel = router.canceler();

    let mut worker = PooledResponder::create(&ctx, router.internal_endpoint()).unwrap();
    let worker_cancel = worker.canceler();
    let working = thread::spawn(move || {
        while let Some(request) = worker.receive().unwrap() {
            let (first, second) = request.get_two_parts();
            let first = first.clone();
            let second = second.cloned().unwrap_or_default();
            request.reply_two_parts(&second, &first).unwrap();
        }
    });
    let relaying = thread::spawn(move || router.run().unwrap());

    let mut requester = Requester::create(&ctx, &peer, "bytes").unwrap();
    let binary: Vec<u8> = (0..=255).collect();
    requester.send_two_parts(&binary, b"").unwrap();
    let (first, second) = requester.receive_two_parts().unwrap().unwrap();
    assert!(first.is_empty());
    assert_eq!(&second[..], &binary[..]);

    worker_cancel.cancel().unwrap();
    working.join().unwrap();
    router_cancel.cancel().unwrap();
    relaying.join().unwrap();
}
