//! Unit tests for sessions

use super::*;
use crate::testing::MockAgent;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn new_session(agent: &Arc<MockAgent>) -> Session {
    Session::new(1234, SessionId::new("s1"), 0, agent.clone())
}

fn text(n: usize) -> AgentMessage {
    AgentMessage::script(ScriptId(1), format!("{{\"n\":{}}}", n), None)
}

fn record_detaches(session: &Session) -> Arc<Mutex<Vec<DetachEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = session.on_detached(move |event| sink.lock().push(event.clone()));
    events
}

#[tokio::test]
async fn test_posts_during_flight_are_coalesced() {
    let agent = MockAgent::new();
    let session = new_session(&agent);

    session.post(text(1)).unwrap();
    session.post(text(2)).unwrap();
    session.post(text(3)).unwrap();

    agent.wait_for_batches(2).await;
    assert_eq!(agent.batch_ids(), vec![1, 3]);
    assert_eq!(agent.posts.lock()[1].0.len(), 2);
    assert_eq!(agent.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_batch_is_dropped() {
    let agent = MockAgent::new();
    agent.fail_posts.store(1, Ordering::SeqCst);
    let session = new_session(&agent);

    session.post(text(1)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while agent.failed_batches.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    // Let the failed delivery task finish clearing the in-flight flag
    tokio::time::sleep(Duration::from_millis(10)).await;

    session.post(text(2)).unwrap();
    agent.wait_for_batches(1).await;

    assert_eq!(*agent.failed_batches.lock(), vec![1]);
    assert_eq!(agent.batch_ids(), vec![2]);
    assert_eq!(agent.delivered_texts(), vec!["{\"n\":2}".to_string()]);
}

#[tokio::test]
async fn test_detach_destroys_scripts_and_notifies_once() {
    let agent = MockAgent::new();
    let session = new_session(&agent);
    let script = session.create_script("send(1)", &ScriptOptions::new()).await.unwrap();
    let events = record_detaches(&session);

    let destroyed = Arc::new(AtomicUsize::new(0));
    let d = destroyed.clone();
    let _sub = script.on_destroyed(move || {
        d.fetch_add(1, Ordering::SeqCst);
    });

    session.detach().await;
    session.detach().await;

    assert!(session.is_detached());
    assert!(script.is_destroyed());
    assert!(session.scripts().is_empty());
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(agent.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *events.lock(),
        vec![DetachEvent {
            reason: DetachReason::ApplicationRequested,
            crash: None
        }]
    );

    assert!(matches!(session.post(text(1)), Err(Error::InvalidOperation(_))));
    assert!(matches!(
        session.create_script("x", &ScriptOptions::new()).await,
        Err(Error::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn test_detach_ignores_close_failure() {
    let agent = MockAgent::new();
    agent.fail_close.store(true, Ordering::SeqCst);
    let session = new_session(&agent);
    let events = record_detaches(&session);

    session.detach().await;

    assert!(session.is_detached());
    assert_eq!(events.lock().len(), 1);
}

#[tokio::test]
async fn test_remote_detach_is_idempotent() {
    let agent = MockAgent::new();
    let session = new_session(&agent);
    let events = record_detaches(&session);

    let crash = serde_json::json!({"summary": "SIGSEGV"});
    session.on_remote_detach(DetachReason::ProcessTerminated, Some(crash.clone()));
    session.on_remote_detach(DetachReason::ConnectionTerminated, None);
    session.detach().await;

    assert_eq!(
        *events.lock(),
        vec![DetachEvent {
            reason: DetachReason::ProcessTerminated,
            crash: Some(crash)
        }]
    );
    assert_eq!(agent.close_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_migration_holds_sends_until_resume() {
    let agent = MockAgent::new();
    agent.resume_reply.store(40, Ordering::SeqCst);
    let session = new_session(&agent);

    session.handle_messages(Vec::new(), 17);
    session.begin_migration().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Interrupted);

    session.post(text(1)).unwrap();
    session.post(text(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(agent.posts.lock().is_empty());

    session.resume().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Attached);
    assert_eq!(*agent.resume_calls.lock(), vec![17]);
    assert_eq!(session.last_rx_batch_id(), 40);

    agent.wait_for_batches(1).await;
    assert_eq!(agent.batch_ids(), vec![2]);

    session.commit_migration().await.unwrap();
    assert_eq!(*agent.calls.lock(), vec!["BeginMigration", "CommitMigration"]);
}

#[tokio::test]
async fn test_resume_outside_interruption() {
    let agent = MockAgent::new();
    let session = new_session(&agent);

    session.resume().await.unwrap();
    assert!(agent.resume_calls.lock().is_empty());

    session.detach().await;
    assert!(matches!(session.resume().await, Err(Error::InvalidOperation(_))));
}

#[tokio::test]
async fn test_inbound_batch_routing() {
    let agent = MockAgent::new();
    let session = new_session(&agent);
    let script = session.create_script("send(1)", &ScriptOptions::new()).await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();
    let _sub = script.on_message(move |m| r.lock().push(m.message.clone()));

    session.handle_messages(
        vec![
            AgentMessage::script(script.id(), "not json", None),
            AgentMessage::script(ScriptId(999), r#"{"type":"send","payload":0}"#, None),
            AgentMessage {
                kind: AgentMessageKind::Debugger,
                script_id: script.id(),
                text: "{}".to_string(),
                data: None,
            },
            AgentMessage::script(script.id(), r#"{"type":"send","payload":1}"#, None),
        ],
        5,
    );

    assert_eq!(session.last_rx_batch_id(), 5);
    assert_eq!(
        *received.lock(),
        vec![serde_json::json!({"type": "send", "payload": 1})]
    );
}

#[tokio::test]
async fn test_malformed_record_does_not_drop_batch() {
    use hookwire_proto::{Codec, Message, MsgPackCodec, Signal};
    use hookwire_transport::{MemoryTransport, Transport};

    let agent = MockAgent::new();
    let session = new_session(&agent);
    let script = session.create_script("send(1)", &ScriptOptions::new()).await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();
    let _sub = script.on_message(move |m| r.lock().push(m.message.clone()));

    let (transport, _listener) = MemoryTransport::new();
    let channel = transport.open().await.unwrap();
    let bus = Bus::new(channel.sender(), Arc::new(MsgPackCodec::new()), Duration::from_secs(1));
    session.listen(&bus);

    let good = AgentMessage::script(script.id(), r#"{"type":"send","payload":1}"#, None);
    let unknown_kind = Value::Struct(vec![
        Value::I32(3),
        script.id().to_value(),
        Value::Str("{}".to_string()),
        Value::Bool(false),
        Value::Bytes(bytes::Bytes::new()),
    ]);
    let signal = Signal::new(
        agent_message_sink_path(session.id()),
        AGENT_MESSAGE_SINK_INTERFACE,
        POST_MESSAGES,
    )
    .with_args(
        "a(i(u)sbay)u",
        vec![Value::Array(vec![good.to_value(), unknown_kind]), Value::U32(9)],
    );
    let frame = MsgPackCodec::new().encode(&Message::Signal(signal)).unwrap();
    bus.handle_frame(&frame);

    assert_eq!(session.last_rx_batch_id(), 9);
    assert_eq!(
        *received.lock(),
        vec![serde_json::json!({"type": "send", "payload": 1})]
    );
}

#[tokio::test]
async fn test_peer_connection_passthrough() {
    let agent = MockAgent::new();
    let session = new_session(&agent);

    let answer = session
        .offer_peer_connection("v=0", VariantDict::new())
        .await
        .unwrap();
    assert_eq!(answer, "answer-to:v=0");
    session.add_candidates(vec!["candidate:1".to_string()]).await.unwrap();
    session.notify_candidate_gathering_done().await.unwrap();

    session.detach().await;
    assert!(matches!(
        session.add_candidates(Vec::new()).await,
        Err(Error::InvalidOperation(_))
    ));
}

#[test]
fn test_decode_detached() {
    let body = vec![
        SessionId::new("s1").to_value(),
        Value::U32(3),
        Value::Str("crashed".to_string()),
    ];
    let (id, reason, crash) = decode_detached(&body).unwrap();
    assert_eq!(id, SessionId::new("s1"));
    assert_eq!(reason, DetachReason::ProcessTerminated);
    assert_eq!(crash, Some(serde_json::json!("crashed")));

    let no_crash = vec![SessionId::new("s1").to_value(), Value::U32(4)];
    assert_eq!(decode_detached(&no_crash).unwrap().2, None);

    let bad_reason = vec![SessionId::new("s1").to_value(), Value::U32(42)];
    assert!(decode_detached(&bad_reason).is_err());
}

#[test]
fn test_detach_reason_codes() {
    for code in 1..=5 {
        assert_eq!(DetachReason::from_code(code).unwrap() as u32, code);
    }
    assert_eq!(DetachReason::from_code(0), None);
    assert_eq!(DetachReason::DeviceLost.to_string(), "device-lost");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Posts interleaved with scheduler yields: every message goes out once,
    /// in order, one batch at a time, each batch id naming its last message.
    #[test]
    fn test_batching_preserves_order(ops in prop::collection::vec(0u8..4, 1..40)) {
        tokio_test::block_on(async move {
            let agent = MockAgent::new();
            let session = new_session(&agent);

            let mut posted = Vec::new();
            for op in ops {
                if op == 0 {
                    tokio::task::yield_now().await;
                } else {
                    let message = text(posted.len() + 1);
                    posted.push(message.text.clone());
                    session.post(message).unwrap();
                }
            }

            tokio::time::timeout(Duration::from_secs(5), async {
                while agent.delivered_texts().len() < posted.len() {
                    tokio::task::yield_now().await;
                }
            })
            .await
            .unwrap();

            assert_eq!(agent.delivered_texts(), posted);
            assert!(agent.max_in_flight.load(Ordering::SeqCst) <= 1);

            let mut delivered = 0u32;
            for (messages, batch_id) in agent.posts.lock().iter() {
                delivered += messages.len() as u32;
                assert_eq!(*batch_id, delivered);
            }
        });
    }
}
