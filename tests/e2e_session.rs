//! End-to-end session tests.
//!
//! Most tests run against the in-memory router in `common`; the ones that
//! need exact ids or misbehaving routers script the router side by hand.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    accept_session, events_until, fast_config, next, phase_becomes, welcome, within, TestRouter, ENDPOINT,
};
use serde_json::json;
use tokio::sync::{mpsc, Barrier};
use wamp::protocol::{reasons, Dict, Message, MessageKind};
use wamp::session::InvocationError;
use wamp::transport;
use wamp::{
    CallOptions, CancelReason, ClientConfig, ConnectionEvent, Format, Payload, Phase,
    PublishOptions, ReconnectPolicy, RegisterOptions, WampError,
};

fn cancelled(result: Result<impl std::fmt::Debug, WampError>) -> CancelReason {
    match result {
        Err(WampError::Cancelled(reason)) => reason,
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_and_close_session() {
    let (router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());

    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    phase_becomes(&connection, Phase::Connected).await;

    let session = within(connection.open("realm1")).await.unwrap();
    phase_becomes(&connection, Phase::Open).await;
    assert_eq!(session.realm(), "realm1");
    assert!(session.router_roles().broker);
    assert!(session.router_roles().dealer);
    assert_eq!(router.sessions(), vec![session.id()]);

    let closed = within(session.close()).await.unwrap();
    assert!(closed.acknowledged);
    assert_eq!(closed.reason, reasons::GOODBYE_AND_OUT);
    phase_becomes(&connection, Phase::Closed).await;

    // a closed session's handle refuses further work
    let after = session.call("com.example.anything", Payload::new()).await;
    assert_eq!(cancelled(after), CancelReason::SessionClosed);
}

#[tokio::test]
async fn test_handshake_rejected() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut events = connection.events();

    let err = within(connection.open("reject")).await.unwrap_err();
    match err {
        WampError::HandshakeRejected { reason, .. } => assert_eq!(reason, reasons::NO_SUCH_REALM),
        other => panic!("expected HandshakeRejected, got {other:?}"),
    }
    let seen = events_until(&mut events, |e| matches!(e, ConnectionEvent::SessionAborted { .. })).await;
    assert_eq!(seen.len(), 1);
    phase_becomes(&connection, Phase::Closed).await;
}

#[tokio::test]
async fn test_open_twice_is_invalid() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let _session = within(connection.open("realm1")).await.unwrap();

    let err = within(connection.open("realm1")).await.unwrap_err();
    assert!(matches!(err, WampError::InvalidState(_)));
    phase_becomes(&connection, Phase::Open).await;
}

#[tokio::test]
async fn test_close_without_reply_times_out() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 3));
    let session = session.unwrap();

    let closing = tokio::spawn(async move { session.close().await });
    match next(&mut peer).await {
        Message::Goodbye { reason, .. } => assert_eq!(reason, reasons::CLOSE_NORMAL),
        other => panic!("expected GOODBYE, got {other:?}"),
    }
    phase_becomes(&connection, Phase::Closing).await;

    let closed = within(closing).await.unwrap().unwrap();
    assert!(!closed.acknowledged);
    assert_eq!(closed.reason, reasons::CLOSE_NORMAL);
    phase_becomes(&connection, Phase::Closed).await;
}

#[tokio::test]
async fn test_peer_goodbye_ends_session() {
    let (connector, mut listener) = transport::channel();
    let config = fast_config().with_reconnect(ReconnectPolicy::never());
    let client = common::client(&connector, config);
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut events = connection.events();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 4));
    let session = session.unwrap();

    peer.send(Message::goodbye(reasons::SYSTEM_SHUTDOWN));
    match next(&mut peer).await {
        Message::Goodbye { reason, .. } => assert_eq!(reason, reasons::GOODBYE_AND_OUT),
        other => panic!("expected GOODBYE reply, got {other:?}"),
    }
    let seen = events_until(&mut events, |e| matches!(e, ConnectionEvent::SessionClosed { .. })).await;
    match seen.last() {
        Some(ConnectionEvent::SessionClosed { reason, by_peer }) => {
            assert_eq!(reason, reasons::SYSTEM_SHUTDOWN);
            assert!(*by_peer);
        },
        other => panic!("unexpected {other:?}"),
    }

    let result = session.publish("com.example.t", Payload::new()).await;
    assert_eq!(cancelled(result), CancelReason::SessionLost);
    phase_becomes(&connection, Phase::Idle).await;
}

#[tokio::test]
async fn test_link_lost_during_handshake() {
    let (connector, mut listener) = transport::channel();
    let config = fast_config().with_reconnect(ReconnectPolicy::never());
    let client = common::client(&connector, config);
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();

    let opening = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.open("realm1").await })
    };
    assert!(matches!(next(&mut peer).await, Message::Hello { .. }));
    peer.fail("router crashed");

    let err = within(opening).await.unwrap().unwrap_err();
    assert!(matches!(err, WampError::TransportFailure(_)));
    phase_becomes(&connection, Phase::Idle).await;
}

#[tokio::test]
async fn test_dropping_handles_stops_engine() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 5));
    let session = session.unwrap();

    drop(session);
    drop(connection);

    match next(&mut peer).await {
        Message::Goodbye { reason, .. } => assert_eq!(reason, reasons::SYSTEM_SHUTDOWN),
        other => panic!("expected GOODBYE, got {other:?}"),
    }
    assert!(within(peer.recv()).await.is_none());
}

// ---------------------------------------------------------------------------
// PubSub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_event_reaches_only_its_subscription() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();
    assert_eq!(session.id(), 1);

    let (t_tx, mut t_rx) = mpsc::unbounded_channel();
    let (u_tx, mut u_rx) = mpsc::unbounded_channel();

    let subscribing = {
        let session = session.clone();
        tokio::spawn(async move {
            let t = session
                .subscribe("t", move |event| {
                    let t_tx = t_tx.clone();
                    async move {
                        let _ = t_tx.send(event);
                        Ok(())
                    }
                })
                .await?;
            let u = session
                .subscribe("u", move |event| {
                    let u_tx = u_tx.clone();
                    async move {
                        let _ = u_tx.send(event);
                        Ok(())
                    }
                })
                .await?;
            Ok::<_, WampError>((t, u))
        })
    };
    for subscription in [1, 2] {
        match next(&mut peer).await {
            Message::Subscribe { request, .. } => {
                peer.send(Message::Subscribed { request, subscription });
            },
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
    }
    let (t, u) = within(subscribing).await.unwrap().unwrap();
    assert_eq!((t.id(), u.id()), (1, 2));

    let payload = Payload::with_args([json!("hello")]).kwarg("n", 1);
    let publishing = session.publish_with(
        "t",
        payload.clone(),
        PublishOptions::default().with_exclude_me(false),
    );
    within(publishing).await.unwrap();
    match next(&mut peer).await {
        Message::Publish { topic, options, payload: sent, .. } => {
            assert_eq!(topic, "t");
            assert_eq!(options.get("exclude_me"), Some(&json!(false)));
            assert!(options.get("acknowledge").is_none());
            assert_eq!(sent, payload);
            peer.send(Message::Event {
                subscription: 1,
                publication: 10,
                details: Dict::new(),
                payload: sent,
            });
        },
        other => panic!("expected PUBLISH, got {other:?}"),
    }

    let event = within(t_rx.recv()).await.unwrap();
    assert_eq!(event.subscription, 1);
    assert_eq!(event.topic, "t");
    assert_eq!(event.payload, payload);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(t_rx.try_recv().is_err());
    assert!(u_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_publish_and_subscribe_across_sessions() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let subscriber = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let publisher = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let sub_session = within(subscriber.open("realm1")).await.unwrap();
    let pub_session = within(publisher.open("realm1")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = within(sub_session.subscribe("com.example.tick", move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.payload.arg(0).cloned());
            Ok(())
        }
    }))
    .await
    .unwrap();

    let publication = within(pub_session.publish_ack("com.example.tick", Payload::with_args([7])))
        .await
        .unwrap();
    assert!(publication.id > 0);
    assert_eq!(within(rx.recv()).await.unwrap(), Some(json!(7)));

    // exclude_me defaults to true: our own publication does not come back
    within(sub_session.publish_ack("com.example.tick", Payload::with_args([8])))
        .await
        .unwrap();
    within(pub_session.publish_ack("com.example.tick", Payload::with_args([9])))
        .await
        .unwrap();
    assert_eq!(within(rx.recv()).await.unwrap(), Some(json!(9)));
}

#[tokio::test]
async fn test_events_keep_order_per_subscription() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let subscriber = within(connection.open("realm1")).await.unwrap();
    let other = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let publisher = within(other.open("realm1")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = within(subscriber.subscribe("com.example.seq", move |event| {
        let tx = tx.clone();
        async move {
            let n = event.payload.arg(0).and_then(serde_json::Value::as_u64).unwrap_or(0);
            // early events take longer
            tokio::time::sleep(Duration::from_millis(20 - n)).await;
            let _ = tx.send(n);
            Ok(())
        }
    }))
    .await
    .unwrap();

    for n in 0..20u64 {
        within(publisher.publish("com.example.seq", Payload::with_args([n])))
            .await
            .unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(within(rx.recv()).await.unwrap());
    }
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_shared_subscription_unsubscribe() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let session = within(connection.open("realm1")).await.unwrap();
    let other = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let publisher = within(other.open("realm1")).await.unwrap();

    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    let a = within(session.subscribe("com.example.shared", move |e| {
        let a_tx = a_tx.clone();
        async move {
            let _ = a_tx.send(e.publication);
            Ok(())
        }
    }))
    .await
    .unwrap();
    let b = within(session.subscribe("com.example.shared", move |e| {
        let b_tx = b_tx.clone();
        async move {
            let _ = b_tx.send(e.publication);
            Ok(())
        }
    }))
    .await
    .unwrap();
    assert_eq!(a.id(), b.id());

    within(publisher.publish_ack("com.example.shared", Payload::new())).await.unwrap();
    within(a_rx.recv()).await.unwrap();
    within(b_rx.recv()).await.unwrap();

    // first listener goes locally; the router subscription stays
    within(a.unsubscribe()).await.unwrap();
    let second = within(publisher.publish_ack("com.example.shared", Payload::new()))
        .await
        .unwrap();
    assert_eq!(within(b_rx.recv()).await.unwrap(), second.id);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a_rx.try_recv().is_err());

    let again = within(a.unsubscribe()).await.unwrap_err();
    assert!(matches!(again, WampError::InvalidState(_)));

    within(b.unsubscribe()).await.unwrap();
    within(publisher.publish_ack("com.example.shared", Payload::new())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(b_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_in_flight_refuses_duplicate() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();

    let subscribing = {
        let session = session.clone();
        tokio::spawn(async move { session.subscribe("com.example.t", |_e| async move { Ok(()) }).await })
    };
    let request = match next(&mut peer).await {
        Message::Subscribe { request, .. } => request,
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    };
    peer.send(Message::Subscribed {
        request,
        subscription: 4,
    });
    let subscription = within(subscribing).await.unwrap().unwrap();

    let first = {
        let subscription = subscription.clone();
        tokio::spawn(async move { subscription.unsubscribe().await })
    };
    let unsubscribe = match next(&mut peer).await {
        Message::Unsubscribe { request, subscription } => {
            assert_eq!(subscription, 4);
            request
        },
        other => panic!("expected UNSUBSCRIBE, got {other:?}"),
    };

    // a second handle to the same listener is refused without a round trip
    let again = within(subscription.clone().unsubscribe()).await.unwrap_err();
    assert!(matches!(again, WampError::InvalidState(_)), "got {again:?}");

    // a router ERROR makes the subscription unsubscribable again
    peer.send(Message::error(
        MessageKind::Unsubscribe,
        unsubscribe,
        "com.example.busy",
        Payload::new(),
    ));
    match within(first).await.unwrap() {
        Err(WampError::OperationFailed { error, .. }) => assert_eq!(error, "com.example.busy"),
        other => panic!("expected OperationFailed, got {other:?}"),
    }

    let retry = tokio::spawn(async move { subscription.unsubscribe().await });
    match next(&mut peer).await {
        Message::Unsubscribe { request, .. } => peer.send(Message::Unsubscribed { request }),
        other => panic!("expected UNSUBSCRIBE, got {other:?}"),
    };
    within(retry).await.unwrap().unwrap();
    phase_becomes(&connection, Phase::Open).await;
}

#[tokio::test]
async fn test_invalid_uris_are_refused_locally() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let session = within(connection.open("realm1")).await.unwrap();

    let err = session.publish("com.example..bad", Payload::new()).await.unwrap_err();
    assert!(matches!(err, WampError::InvalidUri(_)));

    let err = session
        .register("wamp.session.count", |_inv| async move { Ok(Payload::new()) })
        .await
        .unwrap_err();
    assert!(matches!(err, WampError::InvalidUri(_)));

    let err = connection.open("bad realm").await.unwrap_err();
    assert!(matches!(err, WampError::InvalidUri(_)));
}

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_call_registered_procedure() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let callee_conn = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let caller_conn = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let callee = within(callee_conn.open("realm1")).await.unwrap();
    let caller = within(caller_conn.open("realm1")).await.unwrap();

    let registration = within(callee.register("add", |inv| async move {
        let a = inv.payload.arg(0).and_then(serde_json::Value::as_i64).unwrap_or(0);
        let b = inv.payload.arg(1).and_then(serde_json::Value::as_i64).unwrap_or(0);
        Ok(Payload::with_args([a + b]))
    }))
    .await
    .unwrap();
    assert_eq!(registration.procedure(), "add");

    let result = within(caller.call("add", Payload::with_args([20, 55]))).await.unwrap();
    assert_eq!(result.arg(0), Some(&json!(75)));
    assert_eq!(result.payload.args.len(), 1);
}

#[tokio::test]
async fn test_handler_errors_reach_the_caller() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let callee_conn = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let caller_conn = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let callee = within(callee_conn.open("realm1")).await.unwrap();
    let caller = within(caller_conn.open("realm1")).await.unwrap();

    within(callee.register("com.example.refuse", |_inv| async move {
        Err(InvocationError::new("com.example.error.refused")
            .with_payload(Payload::with_args(["not today"])))
    }))
    .await
    .unwrap();
    within(callee.register("com.example.fail", |_inv| async move {
        Err(InvocationError::from(anyhow::anyhow!("disk on fire")))
    }))
    .await
    .unwrap();

    match within(caller.call("com.example.refuse", Payload::new())).await {
        Err(WampError::OperationFailed { error, payload, .. }) => {
            assert_eq!(error, "com.example.error.refused");
            assert_eq!(payload.arg(0), Some(&json!("not today")));
        },
        other => panic!("expected OperationFailed, got {other:?}"),
    }
    match within(caller.call("com.example.fail", Payload::new())).await {
        Err(WampError::OperationFailed { error, payload, .. }) => {
            assert_eq!(error, reasons::RUNTIME_ERROR);
            assert_eq!(payload.arg(0), Some(&json!("disk on fire")));
        },
        other => panic!("expected OperationFailed, got {other:?}"),
    }
    match within(caller.call("com.example.missing", Payload::new())).await {
        Err(WampError::OperationFailed { error, .. }) => assert_eq!(error, reasons::NO_SUCH_PROCEDURE),
        other => panic!("expected OperationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invocation_fault_is_answered_and_engine_stays_open() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();

    let registering = {
        let session = session.clone();
        tokio::spawn(async move {
            let boom = session
                .register("boom", |_inv| async move {
                    if true {
                        panic!("handler blew up");
                    }
                    Ok(Payload::new())
                })
                .await?;
            let echo = session
                .register("echo", |inv| async move { Ok(inv.payload) })
                .await?;
            Ok::<_, WampError>((boom, echo))
        })
    };
    for registration in [100, 101] {
        match next(&mut peer).await {
            Message::Register { request, .. } => {
                peer.send(Message::Registered { request, registration });
            },
            other => panic!("expected REGISTER, got {other:?}"),
        }
    }
    within(registering).await.unwrap().unwrap();

    peer.send(Message::Invocation {
        request: 55,
        registration: 100,
        details: Dict::new(),
        payload: Payload::new(),
    });
    match next(&mut peer).await {
        Message::Error {
            request_type,
            request,
            error,
            ..
        } => {
            assert_eq!(request_type, MessageKind::Invocation);
            assert_eq!(request, 55);
            assert_eq!(error, reasons::RUNTIME_ERROR);
        },
        other => panic!("expected ERROR, got {other:?}"),
    }
    phase_becomes(&connection, Phase::Open).await;

    peer.send(Message::Invocation {
        request: 56,
        registration: 101,
        details: Dict::new(),
        payload: Payload::with_args(["still here"]),
    });
    match next(&mut peer).await {
        Message::Yield { request, payload, .. } => {
            assert_eq!(request, 56);
            assert_eq!(payload.arg(0), Some(&json!("still here")));
        },
        other => panic!("expected YIELD, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invocation_for_unknown_registration() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let _session = session.unwrap();

    peer.send(Message::Invocation {
        request: 77,
        registration: 99,
        details: Dict::new(),
        payload: Payload::new(),
    });
    match next(&mut peer).await {
        Message::Error { request, error, .. } => {
            assert_eq!(request, 77);
            assert_eq!(error, reasons::NO_SUCH_REGISTRATION);
        },
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn test_registration_concurrency() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let callee_conn = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let caller_conn = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let callee = within(callee_conn.open("realm1")).await.unwrap();
    let caller = within(caller_conn.open("realm1")).await.unwrap();

    // both invocations must be in flight at once to pass the barrier
    let barrier = Arc::new(Barrier::new(2));
    within(callee.register_with(
        "com.example.meet",
        RegisterOptions::default().with_concurrency(2),
        move |inv| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                Ok(inv.payload)
            }
        },
    ))
    .await
    .unwrap();

    let (a, b) = within(async {
        tokio::join!(
            caller.call("com.example.meet", Payload::with_args(["a"])),
            caller.call("com.example.meet", Payload::with_args(["b"])),
        )
    })
    .await;
    // results go to the call that asked
    assert_eq!(a.unwrap().arg(0), Some(&json!("a")));
    assert_eq!(b.unwrap().arg(0), Some(&json!("b")));
}

#[tokio::test]
async fn test_unregister() {
    let (_router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let session = within(connection.open("realm1")).await.unwrap();

    let registration = within(session.register("com.example.once", |inv| async move { Ok(inv.payload) }))
        .await
        .unwrap();
    within(session.call("com.example.once", Payload::new())).await.unwrap();

    within(registration.unregister()).await.unwrap();
    match within(session.call("com.example.once", Payload::new())).await {
        Err(WampError::OperationFailed { error, .. }) => assert_eq!(error, reasons::NO_SUCH_PROCEDURE),
        other => panic!("expected OperationFailed, got {other:?}"),
    }
    let again = within(registration.unregister()).await.unwrap_err();
    assert!(matches!(again, WampError::InvalidState(_)));
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_call_timeout_then_late_result() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();

    let slow = session.call_with(
        "com.example.slow",
        Payload::new(),
        CallOptions::default().with_timeout(Duration::from_millis(50)),
    );
    let (result, sent) = tokio::join!(slow, next(&mut peer));
    assert_eq!(cancelled(result), CancelReason::Timeout);
    assert_eq!(sent.request_id(), Some(1));

    // the late RESULT matches nothing and is dropped
    peer.send(Message::Result {
        request: 1,
        details: Dict::new(),
        payload: Payload::with_args(["late"]),
    });

    let calling = {
        let session = session.clone();
        tokio::spawn(async move { session.call("com.example.fast", Payload::new()).await })
    };
    match next(&mut peer).await {
        Message::Call { request, .. } => {
            assert_eq!(request, 2);
            peer.send(Message::Result {
                request,
                details: Dict::new(),
                payload: Payload::with_args([42]),
            });
        },
        other => panic!("expected CALL, got {other:?}"),
    }
    let result = within(calling).await.unwrap().unwrap();
    assert_eq!(result.arg(0), Some(&json!(42)));
    phase_becomes(&connection, Phase::Open).await;
}

#[tokio::test]
async fn test_unknown_and_mismatched_responses_are_dropped() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();

    let subscribing = {
        let session = session.clone();
        tokio::spawn(async move { session.subscribe("com.example.t", |_e| async move { Ok(()) }).await })
    };
    let request = match next(&mut peer).await {
        Message::Subscribe { request, .. } => request,
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    };

    // wrong kind for this id, then an id nobody asked for
    peer.send(Message::Registered {
        request,
        registration: 5,
    });
    peer.send(Message::error(MessageKind::Call, request, "com.example.error", Payload::new()));
    peer.send(Message::Result {
        request: 999,
        details: Dict::new(),
        payload: Payload::new(),
    });
    peer.send(Message::Subscribed {
        request,
        subscription: 7,
    });

    let subscription = within(subscribing).await.unwrap().unwrap();
    assert_eq!(subscription.id(), 7);
    phase_becomes(&connection, Phase::Open).await;
}

#[tokio::test]
async fn test_request_ids_restart_with_each_session() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();

    for expected in 1..=3 {
        within(session.publish("com.example.t", Payload::new())).await.unwrap();
        assert_eq!(next(&mut peer).await.request_id(), Some(expected));
    }

    let closing = {
        let session = session.clone();
        tokio::spawn(async move { session.close().await })
    };
    assert!(matches!(next(&mut peer).await, Message::Goodbye { .. }));
    peer.send(Message::goodbye(reasons::GOODBYE_AND_OUT));
    assert!(within(closing).await.unwrap().unwrap().acknowledged);

    within(connection.reconnect()).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 2));
    let session = session.unwrap();
    within(session.publish("com.example.t", Payload::new())).await.unwrap();
    assert_eq!(next(&mut peer).await.request_id(), Some(1));
}

#[tokio::test]
async fn test_request_ids_restart_after_loss_with_call_outstanding() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();
    let mut events = connection.events();

    for expected in 1..=2 {
        within(session.publish("com.example.t", Payload::new())).await.unwrap();
        assert_eq!(next(&mut peer).await.request_id(), Some(expected));
    }
    let calling = {
        let session = session.clone();
        tokio::spawn(async move { session.call("com.example.slow", Payload::new()).await })
    };
    let old_request = match next(&mut peer).await {
        Message::Call { request, .. } => request,
        other => panic!("expected CALL, got {other:?}"),
    };
    assert_eq!(old_request, 3);

    // lose the link while CALL 3 is outstanding
    peer.fail("link reset");
    assert_eq!(cancelled(within(calling).await.unwrap()), CancelReason::SessionLost);

    let mut peer = within(listener.accept()).await.unwrap();
    welcome(&mut peer, 2).await;
    let seen = events_until(&mut events, |e| matches!(e, ConnectionEvent::SessionOpened(_))).await;
    let Some(ConnectionEvent::SessionOpened(reopened)) = seen.last().cloned() else {
        panic!("expected SessionOpened");
    };
    assert_eq!(reopened.id(), 2);

    let calling = {
        let session = reopened.clone();
        tokio::spawn(async move { session.call("com.example.fast", Payload::new()).await })
    };
    let request = match next(&mut peer).await {
        Message::Call { request, .. } => request,
        other => panic!("expected CALL, got {other:?}"),
    };
    assert_eq!(request, 1);

    // a late RESULT for the old session's id resolves nothing here
    peer.send(Message::Result {
        request: old_request,
        details: Dict::new(),
        payload: Payload::with_args(["late"]),
    });
    peer.send(Message::Result {
        request,
        details: Dict::new(),
        payload: Payload::with_args([42]),
    });
    let result = within(calling).await.unwrap().unwrap();
    assert_eq!(result.arg(0), Some(&json!(42)));
    phase_becomes(&connection, Phase::Open).await;
}

#[tokio::test]
async fn test_disconnect_cancels_pending_requests() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut peer = within(listener.accept()).await.unwrap();
    let (session, ()) = tokio::join!(connection.open("realm1"), welcome(&mut peer, 1));
    let session = session.unwrap();

    let calling = {
        let session = session.clone();
        tokio::spawn(async move { session.call("com.example.never", Payload::new()).await })
    };
    assert!(matches!(next(&mut peer).await, Message::Call { .. }));

    within(connection.disconnect()).await.unwrap();
    assert_eq!(cancelled(within(calling).await.unwrap()), CancelReason::Disconnected);
    phase_becomes(&connection, Phase::Closed).await;
    match next(&mut peer).await {
        Message::Goodbye { reason, .. } => assert_eq!(reason, reasons::SYSTEM_SHUTDOWN),
        other => panic!("expected GOODBYE, got {other:?}"),
    }

    let after = session.publish("com.example.t", Payload::new()).await;
    assert_eq!(cancelled(after), CancelReason::Disconnected);
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_gives_up_after_max_attempts() {
    let (connector, _listener) = transport::channel();
    connector.refuse_connections(true);
    let config = ClientConfig::default().with_reconnect(ReconnectPolicy::fixed(3, Duration::from_millis(5)));
    let client = common::client(&connector, config);

    let err = within(client.connect(ENDPOINT, Format::Json)).await.unwrap_err();
    assert!(matches!(err, WampError::TransportFailure(_)));
    assert_eq!(connector.attempts(), 3);
}

#[tokio::test]
async fn test_zero_max_attempts_fails_immediately() {
    let (connector, _listener) = transport::channel();
    let config = ClientConfig::default().with_reconnect(ReconnectPolicy::fixed(0, Duration::from_millis(5)));
    let client = common::client(&connector, config);

    let err = within(client.connect(ENDPOINT, Format::Json)).await.unwrap_err();
    assert!(matches!(err, WampError::TransportFailure(_)));
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test]
async fn test_connect_succeeds_after_refusals() {
    let (router, connector) = TestRouter::start();
    connector.refuse_connections(true);
    let config = ClientConfig::default().with_reconnect(ReconnectPolicy::fixed(5, Duration::from_millis(30)));
    let client = common::client(&connector, config);

    let connecting = tokio::spawn(async move { client.connect(ENDPOINT, Format::Json).await });
    tokio::time::sleep(Duration::from_millis(45)).await;
    connector.refuse_connections(false);

    let connection = within(connecting).await.unwrap().unwrap();
    assert!(connector.attempts() >= 2);
    assert!(connector.attempts() <= 5);
    within(connection.open("realm1")).await.unwrap();
    assert_eq!(router.sessions().len(), 1);
}

#[tokio::test]
async fn test_session_reopens_after_link_loss() {
    let (router, connector) = TestRouter::start();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let session = within(connection.open("realm1")).await.unwrap();
    let registration = within(session.register("com.example.echo", |inv| async move { Ok(inv.payload) }))
        .await
        .unwrap();
    let mut events = connection.events();

    router.drop_link(session.id());
    let seen = events_until(&mut events, |e| matches!(e, ConnectionEvent::SessionOpened(_))).await;
    assert!(matches!(seen[0], ConnectionEvent::Disconnected { .. }));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ConnectionEvent::Reconnecting { attempt: 1, .. })));
    assert!(seen.iter().any(|e| matches!(e, ConnectionEvent::Connected)));
    let Some(ConnectionEvent::SessionOpened(reopened)) = seen.last() else {
        panic!("expected SessionOpened");
    };
    assert_ne!(reopened.id(), session.id());
    assert_eq!(reopened.realm(), "realm1");
    assert_eq!(router.hellos(), vec!["realm1".to_string(), "realm1".to_string()]);

    // handles from the dead session are cancelled
    let old = session.call("com.example.echo", Payload::new()).await;
    assert_eq!(cancelled(old), CancelReason::SessionLost);
    assert_eq!(cancelled(registration.unregister().await), CancelReason::SessionLost);

    // the new session starts without the old registration
    match within(reopened.call("com.example.echo", Payload::new())).await {
        Err(WampError::OperationFailed { error, .. }) => assert_eq!(error, reasons::NO_SUCH_PROCEDURE),
        other => panic!("expected OperationFailed, got {other:?}"),
    }
    phase_becomes(&connection, Phase::Open).await;
}

#[tokio::test]
async fn test_attempt_counter_resets_after_each_recovery() {
    let (router, connector) = TestRouter::start();
    let config = ClientConfig::default().with_reconnect(ReconnectPolicy::fixed(2, Duration::from_millis(5)));
    let client = common::client(&connector, config);
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut session = within(connection.open("realm1")).await.unwrap();
    let mut events = connection.events();

    for _ in 0..3 {
        router.drop_link(session.id());
        let seen = events_until(&mut events, |e| matches!(e, ConnectionEvent::SessionOpened(_))).await;
        let Some(ConnectionEvent::SessionOpened(next_session)) = seen.last() else {
            panic!("expected SessionOpened");
        };
        session = next_session.clone();
    }
    // one initial attempt plus one per loss; more than max_attempts in total
    assert_eq!(connector.attempts(), 4);
    phase_becomes(&connection, Phase::Open).await;
}

#[tokio::test]
async fn test_loss_without_reconnect_goes_idle() {
    let (router, connector) = TestRouter::start();
    let config = fast_config().with_reconnect(ReconnectPolicy::never());
    let client = common::client(&connector, config);
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let mut phases = connection.phases();
    let session = within(connection.open("realm1")).await.unwrap();

    router.drop_link(session.id());
    within(phases.wait_for(|p| *p == Phase::Idle)).await.unwrap();
    assert_eq!(connector.attempts(), 1);

    // a manual reconnect starts a fresh cycle
    within(connection.reconnect()).await.unwrap();
    let session = within(connection.open("realm1")).await.unwrap();
    assert_eq!(router.sessions(), vec![session.id()]);
}

#[tokio::test]
async fn test_accept_session_helper_matches_router_ids() {
    let (connector, mut listener) = transport::channel();
    let client = common::client(&connector, fast_config());
    let connection = within(client.connect(ENDPOINT, Format::Json)).await.unwrap();
    let opening = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.open("realm1").await })
    };
    let _peer = accept_session(&mut listener, 9).await;
    let session = within(opening).await.unwrap().unwrap();
    assert_eq!(session.id(), 9);
}
