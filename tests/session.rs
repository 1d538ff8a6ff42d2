use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use peer_pilot::config::TransferConfig;
use peer_pilot::model::payload::Value;
use peer_pilot::session::protocol::{decode_message, encode_message, Header, InvokeArgs};
use peer_pilot::session::{
    ChatMessage, ClientStatus, FileEvent, FileEventKind, FileModule, InvokeProgress, MessageEvent,
    MessageModule, ModuleRequest, ProfileEvent, ProfileModule, SessionEvent, SessionManager,
    UserProfile,
};
use peer_pilot::transport::{
    loopback, ChannelPool, ConnectionState, ConnectionType, PeerConnection, TransferProgress,
};
use peer_pilot::Error;

const WAIT: Duration = Duration::from_secs(5);

fn small_chunks() -> TransferConfig {
    TransferConfig {
        chunk_size: 1024,
        ..Default::default()
    }
}

/// Two managers joined over the loopback transport.
async fn connected_pair() -> (Arc<SessionManager>, Arc<SessionManager>) {
    let alice = SessionManager::new("alice");
    let bob = SessionManager::new("bob");
    let (to_bob, to_alice) = loopback::pair("alice", "bob", small_chunks());

    let (a, b) = tokio::join!(
        alice.add_peer_connection("bob", to_bob),
        bob.add_peer_connection("alice", to_alice),
    );
    assert!(a && b);
    (alice, bob)
}

#[tokio::test]
async fn test_invoke_round_trip() {
    let (alice, bob) = connected_pair().await;
    bob.set_invoke_listener("echo", |req| async move {
        assert_eq!(req.source_client_id, "alice");
        Ok(req.data)
    });

    let payload = Bytes::from(vec![7u8; 5000]);
    let reply = tokio::time::timeout(WAIT, alice.invoke("echo", Some(payload.clone()), "bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Some(payload));
}

#[tokio::test]
async fn test_concurrent_invokes_resolve_their_own_reply() {
    let (alice, bob) = connected_pair().await;
    bob.set_invoke_listener("slow-echo", |req| async move {
        let delay = req.data.as_ref().map(|d| d[0] as u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay * 10)).await;
        Ok(req.data)
    });

    let calls = (1..=5u8).rev().map(|n| {
        let alice = alice.clone();
        async move {
            let reply = alice
                .invoke("slow-echo", Some(Bytes::from(vec![n])), "bob")
                .await
                .unwrap();
            (n, reply)
        }
    });
    for (n, reply) in futures::future::join_all(calls).await {
        assert_eq!(reply, Some(Bytes::from(vec![n])));
    }
}

#[tokio::test]
async fn test_unknown_and_stale_replies_are_ignored() {
    let alice = SessionManager::new("alice");
    let (to_bob, raw_bob) = loopback::pair("alice", "bob", small_chunks());
    let mut at_bob = raw_bob.take_received().unwrap();
    let (connected, _) = tokio::join!(
        alice.add_peer_connection("bob", to_bob),
        raw_bob.wait_established(),
    );
    assert!(connected);

    let call = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.invoke("echo", None, "bob").await })
    };

    let request = tokio::time::timeout(WAIT, at_bob.recv()).await.unwrap().unwrap();
    let Header::Invoke(InvokeArgs {
        reply_id: Some(reply_id),
        ..
    }) = decode_message(&request.bytes).unwrap().0
    else {
        panic!("expected an invoke request");
    };

    let reply = |id: &str, body: &'static [u8]| {
        encode_message(&Header::reply(id), Some(&Bytes::from_static(body))).unwrap()
    };
    for (id, body) in [
        ("echo:reply:bogus", b"bogus".as_slice()),
        ("other:reply:xyz", b"other".as_slice()),
        (reply_id.as_str(), b"real".as_slice()),
        (reply_id.as_str(), b"again".as_slice()),
    ] {
        raw_bob.pool().send(reply(id, body), None).await.unwrap();
    }

    let result = tokio::time::timeout(WAIT, call).await.unwrap().unwrap();
    assert_eq!(result.unwrap(), Some(Bytes::from_static(b"real")));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.peer_state("bob"), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn test_invoke_reports_progress_per_call() {
    let (alice, bob) = connected_pair().await;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    bob.set_invoke_listener_with_progress(
        "echo",
        |req| async move { Ok(req.data) },
        Arc::new(move |progress: &TransferProgress| {
            let _ = reply_tx.send(*progress);
        }),
    );

    let requests = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(Mutex::new(Vec::new()));
    let progress = InvokeProgress {
        on_request: Some(Arc::new({
            let requests = requests.clone();
            move |p: &TransferProgress| requests.lock().push(*p)
        })),
        on_response: Some(Arc::new({
            let responses = responses.clone();
            move |p: &TransferProgress| responses.lock().push(*p)
        })),
    };

    // a concurrent transfer on the same connection is not reported
    let payload = Bytes::from(vec![1u8; 5000]);
    let (reply, noise) = tokio::join!(
        alice.invoke_with_progress("echo", Some(payload.clone()), "bob", progress),
        alice.broadcast("noise", Some(Bytes::from(vec![2u8; 5000])), None),
    );
    assert_eq!(reply.unwrap(), Some(payload));
    assert_eq!(noise.unwrap(), 1);

    let requests = requests.lock().clone();
    let last = *requests.last().unwrap();
    assert_eq!(last.transferred, last.total);
    assert!(last.total > 5000);
    assert!(requests.iter().all(|p| p.stream_id == last.stream_id));

    let responses = responses.lock().clone();
    let last = *responses.last().unwrap();
    assert!(last.total > 1);
    assert_eq!(last.transferred, last.total);
    assert_eq!(responses.len(), last.total);
    assert!(responses.iter().all(|p| p.stream_id == last.stream_id));

    loop {
        let sent = tokio::time::timeout(WAIT, reply_rx.recv()).await.unwrap().unwrap();
        if sent.transferred == sent.total {
            assert!(sent.total > 5000);
            break;
        }
    }
}

#[tokio::test]
async fn test_teardown_aborts_running_handlers() {
    let (alice, bob) = connected_pair().await;
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
    let dropped_tx = Arc::new(Mutex::new(Some(dropped_tx)));
    bob.set_invoke_listener("hold", move |_| {
        let started = started_tx.clone();
        let guard = dropped_tx.lock().take();
        async move {
            let _guard = guard;
            let _ = started.send(());
            std::future::pending::<()>().await;
            Ok(None)
        }
    });

    let _call = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.invoke("hold", None, "bob").await })
    };
    tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();

    assert!(bob.remove_peer_connection("alice"));
    // the handler future is dropped along with its guard
    assert!(tokio::time::timeout(WAIT, dropped_rx).await.is_ok());
}

#[tokio::test]
async fn test_invoke_without_handler_stays_pending() {
    let (alice, _bob) = connected_pair().await;
    let call = alice.invoke("unknown", None, "bob");
    assert!(tokio::time::timeout(Duration::from_millis(200), call)
        .await
        .is_err());
}

#[tokio::test]
async fn test_invoke_offline_target() {
    let (alice, _bob) = connected_pair().await;
    let err = alice.invoke("echo", None, "carol").await.unwrap_err();
    assert!(matches!(err, Error::TargetOffline(id) if id == "carol"));
}

#[tokio::test]
async fn test_broadcast_reaches_listener() {
    let (alice, bob) = connected_pair().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = bob.add_broadcast_listener("news", move |msg| {
        let _ = tx.send((msg.source_client_id.clone(), msg.data.clone()));
    });

    let delivered = alice
        .broadcast("news", Some(Bytes::from_static(b"hello")), None)
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let (source, data) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(source, "alice");
    assert_eq!(data, Some(Bytes::from_static(b"hello")));

    // unknown recipients are skipped
    let delivered = alice
        .broadcast("news", None, Some(vec!["carol".into()]))
        .await
        .unwrap();
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn test_remote_close_tears_down_both_sides() {
    let (alice, bob) = connected_pair().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = bob.events().on(SessionEvent::PeerDisconnected, move |peer: &String| {
        let _ = tx.send(peer.clone());
    });

    assert!(alice.remove_peer_connection("bob"));
    assert!(!alice.remove_peer_connection("bob"));

    let gone = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(gone, "alice");
    assert!(bob.peers().is_empty());
    assert!(alice.peer_state("bob").is_none());
}

#[tokio::test]
async fn test_teardown_fails_pending_invoke() {
    let (alice, bob) = connected_pair().await;
    bob.set_invoke_listener("never", |_| async move {
        std::future::pending::<()>().await;
        Ok(None)
    });

    let call = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.invoke("never", None, "bob").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.remove_peer_connection("bob");

    let result = tokio::time::timeout(WAIT, call).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Network(_))));
}

#[tokio::test]
async fn test_failed_connection_is_removed() {
    let carol = SessionManager::new("carol");
    let (to_dave, to_carol) = loopback::pair("carol", "dave", small_chunks());
    to_carol.close();
    to_dave.close();

    assert!(!carol.add_peer_connection("dave", to_dave).await);
    assert!(carol.peers().is_empty());
    assert_eq!(carol.peer_state("dave"), None::<ConnectionState>);
}

#[tokio::test]
async fn test_module_invoke_between_peers() {
    let (alice, bob) = connected_pair().await;
    let math = peer_pilot::session::Module::new("math", bob).unwrap();
    math.set_invoke_listener("double", |req: ModuleRequest| async move {
        match req.data {
            Some(Value::Number(n)) => Ok(Some(Value::Number(n * 2.0))),
            _ => Ok(None),
        }
    });

    let caller = peer_pilot::session::Module::new("math", alice).unwrap();
    let reply = tokio::time::timeout(WAIT, caller.invoke("double", Some(Value::Number(4.5)), "bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Some(Value::Number(9.0)));
}

#[tokio::test]
async fn test_message_module() {
    let (alice, bob) = connected_pair().await;
    let sender = MessageModule::new(alice).unwrap();
    let receiver = MessageModule::new(bob).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = receiver
        .events()
        .on(MessageEvent::Received, move |msg: &ChatMessage| {
            let _ = tx.send(msg.clone());
        });

    assert_eq!(sender.send("hi bob").await.unwrap(), 1);
    let msg = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        msg,
        ChatMessage {
            source_client_id: "alice".into(),
            text: "hi bob".into()
        }
    );
}

#[tokio::test]
async fn test_profile_module_tracks_peers() {
    let alice = SessionManager::new("alice");
    let bob = SessionManager::new("bob");
    let alice_profiles = ProfileModule::new(alice.clone(), UserProfile { name: "Alice".into() }).unwrap();
    let bob_profiles = ProfileModule::new(bob.clone(), UserProfile { name: "Bob".into() }).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _connected = alice_profiles
        .events()
        .on(ProfileEvent::PeerConnected, move |client| {
            let _ = tx.send(client.clone());
        });

    let (to_bob, to_alice) = loopback::pair("alice", "bob", small_chunks());
    let (a, b) = tokio::join!(
        alice.add_peer_connection("bob", to_bob),
        bob.add_peer_connection("alice", to_alice),
    );
    assert!(a && b);

    let client = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(client.client_id, "bob");
    assert_eq!(client.status, ClientStatus::Connected);
    assert_eq!(client.profile, Some(UserProfile { name: "Bob".into() }));
    assert_eq!(client.connection_type, ConnectionType::Direct);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _changed = alice_profiles
        .events()
        .on(ProfileEvent::PeerChanged, move |client| {
            let _ = tx.send(client.clone());
        });
    bob_profiles
        .set_profile(UserProfile { name: "Robert".into() })
        .await
        .unwrap();
    let client = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(client.profile, Some(UserProfile { name: "Robert".into() }));

    alice.remove_peer_connection("bob");
    assert_eq!(
        alice_profiles.client("bob").map(|c| c.status),
        Some(ClientStatus::Disconnected)
    );
}

#[tokio::test]
async fn test_profile_follows_connection_type() {
    let alice = SessionManager::new("alice");
    let profiles = ProfileModule::new(alice.clone(), UserProfile { name: "Alice".into() }).unwrap();

    let (pool, received) = ChannelPool::new("bob", small_chunks());
    let (state, state_rx) = watch::channel(ConnectionState::Connecting);
    let (route, route_rx) = watch::channel(ConnectionType::Unknown);
    let (commands, _driver) = mpsc::unbounded_channel();
    let conn = PeerConnection::new("bob", pool, received, state_rx, commands)
        .with_connection_type(route_rx);

    let adding = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.add_peer_connection("bob", conn).await })
    };
    state.send(ConnectionState::Connected).unwrap();
    assert!(tokio::time::timeout(WAIT, adding).await.unwrap().unwrap());
    assert_eq!(alice.connection_type("bob"), Some(ConnectionType::Unknown));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _changed = profiles
        .events()
        .on(ProfileEvent::PeerChanged, move |client| {
            let _ = tx.send(client.clone());
        });

    route.send(ConnectionType::Relay).unwrap();
    let client = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(client.client_id, "bob");
    assert_eq!(client.connection_type, ConnectionType::Relay);
    assert_eq!(alice.connection_type("bob"), Some(ConnectionType::Relay));
}

#[tokio::test]
async fn test_file_module_transfers_bytes() {
    let (alice, bob) = connected_pair().await;
    let sender = FileModule::new(alice).unwrap();
    let receiver = FileModule::new(bob).unwrap();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let _progress = receiver.events().on(FileEventKind::Progress, {
        let progress = progress.clone();
        move |event: &FileEvent| {
            if let FileEvent::Progress {
                received_chunks,
                total_chunks,
                ..
            } = event
            {
                progress.lock().push((*received_chunks, *total_chunks));
            }
        }
    });

    let received = Arc::new(Mutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = receiver.events().on(FileEventKind::Received, {
        let received = received.clone();
        move |event: &FileEvent| {
            *received.lock() = Some(event.clone());
            let _ = tx.send(());
        }
    });

    let data = Bytes::from((0..200_000u32).map(|i| i as u8).collect::<Vec<u8>>());
    let offered = sender
        .send("blob.bin", data.clone(), None, None)
        .await
        .unwrap();
    assert_eq!(offered, 1);

    tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let event = received.lock().take();
    match event {
        Some(FileEvent::Received {
            filename,
            source_client_id,
            data: got,
        }) => {
            assert_eq!(filename, "blob.bin");
            assert_eq!(source_client_id, "alice");
            assert_eq!(got, data);
        }
        other => panic!("unexpected file event: {:?}", other),
    }

    let progress = progress.lock().clone();
    let (last_received, total) = *progress.last().unwrap();
    assert!(total > 100);
    assert_eq!(last_received, total);
    assert_eq!(progress.len(), total);
}

#[tokio::test]
async fn test_file_module_reports_expired_offer() {
    let (alice, bob) = connected_pair().await;
    let sender = FileModule::new(alice).unwrap();
    let receiver = FileModule::new(bob).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = receiver
        .events()
        .on(FileEventKind::Failed, move |event: &FileEvent| {
            let _ = tx.send(event.clone());
        });

    sender
        .send("late.bin", Bytes::from_static(b"x"), Some(Duration::ZERO), None)
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, FileEvent::Failed { filename, .. } if filename == "late.bin"));
}
