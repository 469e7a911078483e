//! End-to-end room scenarios: live sync, gap filling, local echoes and
//! decryption retries against one store.

use roomlog_core::{FetchedPage, StateBlock, SyncPayload, TimelineBlock, TimelineEntry};
use roomlog_store::{DecryptionResult, Event, Store};
use roomlog_sync::{
    DecryptionRequest, MockDecryptor, MockPaginator, RetryConfig, Room, RoomConfig, RoomKey,
    SyncError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const ROOM: &str = "!room:hs";
const ME: &str = "@me:hs";

fn event(id: &str, event_type: &str, content: Value) -> Event {
    Event {
        event_id: id.into(),
        event_type: event_type.into(),
        room_id: None,
        sender: "@a:hs".into(),
        origin_server_ts: 1,
        content,
        state_key: None,
        unsigned: None,
        redacts: None,
    }
}

fn message(id: &str) -> Event {
    event(id, "m.room.message", json!({"body": id}))
}

fn reaction(id: &str, target: &str, key: &str) -> Event {
    event(
        id,
        "m.reaction",
        json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": target, "key": key}}),
    )
}

fn encrypted(id: &str, session: &str) -> Event {
    event(
        id,
        "m.room.encrypted",
        json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "session_id": session,
            "cleartext": {"type": "m.room.message", "content": {"body": "secret"}},
        }),
    )
}

fn payload(events: Vec<Event>, limited: bool, prev_batch: &str) -> SyncPayload {
    SyncPayload {
        state: StateBlock::default(),
        timeline: TimelineBlock {
            events,
            limited,
            prev_batch: Some(prev_batch.into()),
        },
    }
}

struct Harness {
    store: Arc<Store>,
    paginator: Arc<MockPaginator>,
    decryptor: Arc<MockDecryptor>,
    room: Room<MockPaginator, MockDecryptor>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(Store::new()))
    }

    fn with_store(store: Arc<Store>) -> Self {
        let paginator = Arc::new(MockPaginator::new());
        let decryptor = Arc::new(MockDecryptor::new());
        let config = RoomConfig::new(ME).with_retry(RetryConfig::no_retry());
        let room = Room::new(
            ROOM,
            Arc::clone(&store),
            Arc::clone(&paginator),
            Arc::clone(&decryptor),
            config,
        );
        Self {
            store,
            paginator,
            decryptor,
            room,
        }
    }

    fn event_ids(&self) -> Vec<String> {
        self.room
            .timeline()
            .entries()
            .filter_map(|e| match e {
                TimelineEntry::Event(e) => Some(e.event_id().to_owned()),
                TimelineEntry::Pending(p) => Some(format!("~{}", p.event_type())),
                TimelineEntry::Boundary(_) => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn duplicate_ids_in_one_payload_are_written_once() {
    let h = Harness::new();
    h.room
        .sync(&payload(vec![message("a"), message("b"), message("a")], false, "t0"), false)
        .await
        .unwrap();
    assert_eq!(h.event_ids(), ["a", "b"]);
}

#[tokio::test]
async fn event_repeated_across_payloads_keeps_the_rest() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a"), message("b")], false, "t0"), false).await.unwrap();
    h.room.sync(&payload(vec![message("b"), message("c")], false, "t1"), false).await.unwrap();
    assert_eq!(h.event_ids(), ["a", "b", "c"]);
    assert!(h.store.begin_read().event_by_id(ROOM, "c").is_some());
}

#[tokio::test]
async fn rejoin_rewrites_only_events_after_the_last_stored_one() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a"), message("b")], false, "t0"), false).await.unwrap();
    h.room
        .sync(&payload(vec![message("a"), message("b"), message("c")], true, "t1"), true)
        .await
        .unwrap();
    assert_eq!(h.event_ids(), ["a", "b", "c"]);
    assert_eq!(h.store.begin_read().segments(ROOM).len(), 1);
}

#[tokio::test]
async fn limited_sync_gap_is_filled_and_linked() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a"), message("b")], false, "t0"), false).await.unwrap();
    h.room.sync(&payload(vec![message("e")], true, "t5"), false).await.unwrap();
    assert_eq!(h.event_ids(), ["e"]);

    h.paginator.push_page(FetchedPage {
        chunk: vec![message("d"), message("c"), message("b"), message("a")],
        start: "t5".into(),
        end: Some("t2".into()),
        state: Vec::new(),
    });
    let at_start = h.room.load_more(10).await.unwrap();
    assert!(!at_start);
    assert_eq!(h.event_ids(), ["a", "b", "c", "d", "e"]);

    let read = h.store.begin_read();
    let old = read.segment(ROOM, 0).unwrap();
    let new = read.segment(ROOM, 1).unwrap();
    assert_eq!(old.next_id, Some(1));
    assert_eq!(new.previous_id, Some(0));
    assert_eq!(old.next_token, None);
    assert_eq!(new.previous_token, None);
}

#[tokio::test]
async fn sync_during_gap_fill_keeps_timeline_in_store_order() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a"), message("b")], false, "t0"), false).await.unwrap();
    h.room.sync(&payload(vec![message("e")], true, "t5"), false).await.unwrap();
    h.paginator.set_delay(Duration::from_millis(20));
    h.paginator.push_page(FetchedPage {
        chunk: vec![message("d"), message("c"), message("b"), message("a")],
        start: "t5".into(),
        end: Some("t2".into()),
        state: Vec::new(),
    });

    let top = h.room.timeline().get(0).unwrap().as_boundary().unwrap().clone();
    let next = payload(vec![message("f")], false, "t6");
    let (filled, synced) = tokio::join!(h.room.fill_gap(&top), h.room.sync(&next, false));
    assert!(filled.unwrap());
    synced.unwrap();
    assert_eq!(h.event_ids(), ["a", "b", "c", "d", "e", "f"]);

    let reloaded = Harness::with_store(Arc::clone(&h.store));
    reloaded.room.load().await.unwrap();
    assert_eq!(reloaded.event_ids(), h.event_ids());
}

#[tokio::test]
async fn fill_without_overlap_replaces_token() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("g")], false, "t9"), false).await.unwrap();
    h.paginator.push_page(FetchedPage {
        chunk: vec![message("f"), message("e"), message("d"), message("c")],
        start: "t9".into(),
        end: Some("t4".into()),
        state: Vec::new(),
    });

    let top = h.room.timeline().get(0).unwrap().as_boundary().unwrap().clone();
    assert!(h.room.fill_gap(&top).await.unwrap());
    assert_eq!(h.event_ids(), ["c", "d", "e", "f", "g"]);
    let read = h.store.begin_read();
    assert_eq!(read.segment(ROOM, 0).unwrap().previous_token.as_deref(), Some("t4"));
}

#[tokio::test]
async fn empty_page_reaches_start_of_room() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a")], false, "t0"), false).await.unwrap();
    h.paginator.push_page(FetchedPage {
        chunk: Vec::new(),
        start: "t0".into(),
        end: None,
        state: Vec::new(),
    });
    assert!(h.room.load_more(10).await.unwrap());
    assert!(h.room.load_more(10).await.unwrap());
    assert_eq!(h.paginator.requests().len(), 1);
}

#[tokio::test]
async fn fatal_fetch_failure_leaves_gap_in_place() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a")], false, "t0"), false).await.unwrap();
    h.paginator.push_failure("t0", false);

    let err = h.room.load_more(10).await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch { .. }));
    let read = h.store.begin_read();
    assert_eq!(read.segment(ROOM, 0).unwrap().previous_token.as_deref(), Some("t0"));
}

#[tokio::test]
async fn redacting_a_reaction_decrements_its_key() {
    let h = Harness::new();
    h.room
        .sync(
            &payload(
                vec![message("a"), reaction("r1", "a", "👍"), reaction("r2", "a", "👍")],
                false,
                "t0",
            ),
            false,
        )
        .await
        .unwrap();
    assert_eq!(h.room.timeline().find_event("a").unwrap().annotation_count("👍"), 2);

    let mut redaction = event("x1", "m.room.redaction", json!({}));
    redaction.redacts = Some("r1".into());
    h.room.sync(&payload(vec![redaction], false, "t1"), false).await.unwrap();

    let timeline = h.room.timeline();
    assert_eq!(timeline.find_event("a").unwrap().annotation_count("👍"), 1);
    assert!(timeline.find_event("r1").unwrap().is_redacted());
}

#[tokio::test]
async fn local_reaction_is_replaced_by_its_remote_echo() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a")], false, "t0"), false).await.unwrap();
    let txn_id = h
        .room
        .enqueue(
            "m.reaction",
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": "a", "key": "🎉"}}),
            None,
        )
        .unwrap();
    {
        let timeline = h.room.timeline();
        let target = timeline.find_event("a").unwrap();
        assert!(target.have_annotation("🎉"));
        assert_eq!(target.annotation_count("🎉"), 1);
    }
    assert_eq!(h.event_ids(), ["a", "~m.reaction"]);

    let mut echo = reaction("r1", "a", "🎉");
    echo.sender = ME.into();
    echo.unsigned = Some(json!({"transaction_id": txn_id}));
    h.room.sync(&payload(vec![echo], false, "t1"), false).await.unwrap();

    assert_eq!(h.event_ids(), ["a", "r1"]);
    assert!(h.store.begin_read().pending_events(ROOM).is_empty());
    let timeline = h.room.timeline();
    let target = timeline.find_event("a").unwrap();
    assert!(target.have_annotation("🎉"));
    assert_eq!(target.annotation_count("🎉"), 1);
}

#[tokio::test]
async fn cancelled_local_echo_disappears() {
    let h = Harness::new();
    h.room.sync(&payload(vec![message("a")], false, "t0"), false).await.unwrap();
    let txn_id = h.room.enqueue("m.room.message", json!({"body": "hi"}), None).unwrap();
    assert_eq!(h.store.begin_read().pending_events(ROOM).len(), 1);

    assert!(h.room.cancel_pending(&txn_id).unwrap());
    assert!(!h.room.cancel_pending(&txn_id).unwrap());
    assert_eq!(h.event_ids(), ["a"]);
    assert!(h.store.begin_read().pending_events(ROOM).is_empty());
}

#[tokio::test]
async fn room_key_retries_waiting_events() {
    let h = Harness::new();
    h.room
        .sync(&payload(vec![encrypted("x", "s1"), encrypted("y", "s2")], false, "t0"), false)
        .await
        .unwrap();
    assert!(h.room.timeline().find_event("x").unwrap().needs_decryption());

    h.decryptor.add_session("s1");
    let outcome = h
        .room
        .notify_room_key(&DecryptionRequest::new(), &RoomKey::new("s1"), &[])
        .await
        .unwrap();
    assert_eq!(outcome.decrypted, ["x"]);
    assert!(outcome.failed.is_empty());

    let timeline = h.room.timeline();
    let x = timeline.find_event("x").unwrap();
    assert!(!x.needs_decryption());
    assert_eq!(x.content()["body"], "secret");
    assert!(timeline.find_event("y").unwrap().needs_decryption());
}

#[tokio::test]
async fn disposed_retry_leaves_store_untouched() {
    let h = Harness::new();
    h.room.sync(&payload(vec![encrypted("x", "s1")], false, "t0"), false).await.unwrap();
    h.decryptor.add_session("s1");
    let before = h.store.begin_read().event_by_id(ROOM, "x").unwrap().clone();

    let request = DecryptionRequest::new();
    request.dispose();
    let err = h
        .room
        .notify_room_key(&request, &RoomKey::new("s1"), &["x".to_owned()])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(h.store.begin_read().event_by_id(ROOM, "x").unwrap(), &before);
}

#[tokio::test]
async fn retry_without_the_key_keeps_earlier_cleartext() {
    let h = Harness::new();
    h.room.sync(&payload(vec![encrypted("x", "s1")], false, "t0"), false).await.unwrap();
    h.decryptor.add_session("s1");
    h.room
        .notify_room_key(&DecryptionRequest::new(), &RoomKey::new("s1"), &[])
        .await
        .unwrap();

    let other = Harness::with_store(Arc::clone(&h.store));
    other.room.load().await.unwrap();
    let outcome = other
        .room
        .notify_room_key(&DecryptionRequest::new(), &RoomKey::new("s1"), &["x".to_owned()])
        .await
        .unwrap();
    assert!(outcome.failed.is_empty());
    let read = h.store.begin_read();
    let stored = read.event_by_id(ROOM, "x").unwrap();
    assert!(matches!(stored.decryption, Some(DecryptionResult::Decrypted { .. })));
}

#[tokio::test]
async fn timeline_survives_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rooms.rlog");
    {
        let h = Harness::new();
        h.room.sync(&payload(vec![message("a"), message("b")], false, "t0"), false).await.unwrap();
        h.room.enqueue("m.room.message", json!({"body": "later"}), None).unwrap();
        h.store.save_to_file(&path).unwrap();
    }

    let h = Harness::with_store(Arc::new(Store::open_file(&path).unwrap()));
    h.room.load().await.unwrap();
    assert_eq!(h.event_ids(), ["a", "b", "~m.room.message"]);

    h.room.sync(&payload(vec![message("c")], false, "t1"), false).await.unwrap();
    assert_eq!(h.event_ids(), ["a", "b", "c", "~m.room.message"]);
}
