//! Inspect command implementation.

use super::{open, select_rooms, CommandError};
use roomlog_core::SegmentOrderIndex;
use roomlog_store::{DecryptionResult, SegmentId, Tables};
use serde::Serialize;
use std::path::Path;

/// Snapshot inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Snapshot path.
    pub path: String,
    /// Last committed sequence number.
    pub committed_seq: u64,
    /// Per-room statistics.
    pub rooms: Vec<RoomStats>,
}

/// Statistics for a single room.
#[derive(Debug, Serialize)]
pub struct RoomStats {
    /// Room id.
    pub room_id: String,
    /// Number of stored events.
    pub event_count: usize,
    /// Number of encrypted events without a successful decryption.
    pub undecrypted_count: usize,
    /// Number of relation index entries.
    pub relation_count: usize,
    /// Number of queued local echoes.
    pub pending_count: usize,
    /// Id of the live segment.
    pub live_segment: Option<SegmentId>,
    /// Linked segment chains, oldest first. Empty if the links are broken.
    pub islands: Vec<Vec<SegmentId>>,
    /// Segment details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentStats>>,
}

/// Statistics for a single segment.
#[derive(Debug, Serialize)]
pub struct SegmentStats {
    /// Segment id.
    pub id: SegmentId,
    /// Number of events in it.
    pub event_count: usize,
    /// Preceding segment.
    pub previous_id: Option<SegmentId>,
    /// Following segment.
    pub next_id: Option<SegmentId>,
    /// Whether the start edge still has a gap to fill.
    pub gap_before: bool,
    /// Whether the end edge still has a gap to fill.
    pub gap_after: bool,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    room: Option<&str>,
    show_segments: bool,
    format: &str,
) -> Result<(), CommandError> {
    let store = open(path)?;
    let read = store.begin_read();
    let rooms = select_rooms(read.room_ids(), room)?;
    let result = InspectResult {
        path: path.display().to_string(),
        committed_seq: store.committed_seq(),
        rooms: rooms
            .iter()
            .map(|room_id| room_stats(&read, room_id, show_segments))
            .collect(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Collects the statistics of one room.
pub fn room_stats(tables: &Tables, room_id: &str, show_segments: bool) -> RoomStats {
    let segments = tables.segments(room_id);
    let islands = match SegmentOrderIndex::from_segments(room_id, &segments) {
        Ok(index) => index.islands().to_vec(),
        Err(err) => {
            tracing::warn!(room_id, error = %err, "segment links are broken");
            Vec::new()
        }
    };

    let mut event_count = 0;
    let mut undecrypted_count = 0;
    for record in tables.room_events(room_id) {
        event_count += 1;
        let decrypted = matches!(record.decryption, Some(DecryptionResult::Decrypted { .. }));
        if record.event.is_encrypted() && !decrypted {
            undecrypted_count += 1;
        }
    }

    let segments = show_segments.then(|| {
        segments
            .iter()
            .map(|segment| SegmentStats {
                id: segment.id,
                event_count: tables
                    .room_events(room_id)
                    .filter(|r| r.segment_id == segment.id)
                    .count(),
                previous_id: segment.previous_id,
                next_id: segment.next_id,
                gap_before: segment.previous_token.is_some(),
                gap_after: segment.next_token.is_some(),
            })
            .collect()
    });

    RoomStats {
        room_id: room_id.to_owned(),
        event_count,
        undecrypted_count,
        relation_count: tables.room_relations(room_id).count(),
        pending_count: tables.pending_events(room_id).len(),
        live_segment: tables.live_segment(room_id).map(|s| s.id),
        islands,
        segments,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Snapshot: {}", result.path);
    println!("Committed sequence: {}", result.committed_seq);
    println!("Rooms: {}", result.rooms.len());

    for room in &result.rooms {
        println!();
        println!("{}", room.room_id);
        println!("  Events:        {}", room.event_count);
        println!("  Undecrypted:   {}", room.undecrypted_count);
        println!("  Relations:     {}", room.relation_count);
        println!("  Local echoes:  {}", room.pending_count);
        match room.live_segment {
            Some(id) => println!("  Live segment:  {id}"),
            None => println!("  Live segment:  none"),
        }
        println!("  Islands:       {}", room.islands.len());
        for island in &room.islands {
            let chain: Vec<String> = island.iter().map(ToString::to_string).collect();
            println!("    {}", chain.join(" -> "));
        }

        if let Some(segments) = &room.segments {
            println!(
                "  {:>8} {:>8} {:>8} {:>8} {:>6} {:>6}",
                "Segment", "Events", "Prev", "Next", "GapB", "GapA"
            );
            for s in segments {
                println!(
                    "  {:>8} {:>8} {:>8} {:>8} {:>6} {:>6}",
                    s.id,
                    s.event_count,
                    s.previous_id.map_or_else(|| "-".to_owned(), |id| id.to_string()),
                    s.next_id.map_or_else(|| "-".to_owned(), |id| id.to_string()),
                    s.gap_before,
                    s.gap_after,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlog_store::{Event, EventRecord, SegmentRecord, Store};
    use serde_json::json;

    fn event(id: &str, event_type: &str) -> Event {
        Event {
            event_id: id.into(),
            event_type: event_type.into(),
            room_id: None,
            sender: "@a:hs".into(),
            origin_server_ts: 1,
            content: json!({}),
            state_key: None,
            unsigned: None,
            redacts: None,
        }
    }

    fn two_islands() -> Store {
        let store = Store::new();
        let mut txn = store.begin_write();
        txn.add_segment(SegmentRecord::new("!r", 0).with_previous_token(Some("t0".into())))
            .unwrap();
        txn.add_segment(SegmentRecord::new("!r", 1).with_previous_token(Some("t5".into())))
            .unwrap();
        txn.insert_event(EventRecord::new("!r", 0, 0, event("a", "m.room.message")))
            .unwrap();
        txn.insert_event(EventRecord::new("!r", 1, 0, event("e", "m.room.encrypted")))
            .unwrap();
        txn.commit().unwrap();
        store
    }

    #[test]
    fn reports_islands_and_counts() {
        let store = two_islands();
        let stats = room_stats(&store.begin_read(), "!r", true);
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.undecrypted_count, 1);
        assert_eq!(stats.islands.len(), 2);
        assert_eq!(stats.live_segment, Some(1));
        let segments = stats.segments.unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.gap_before && s.event_count == 1));
    }

    #[test]
    fn unknown_room_is_an_error() {
        let err = select_rooms(vec!["!r".into()], Some("!other")).unwrap_err();
        assert!(matches!(err, CommandError::UnknownRoom(_)));
    }

    #[test]
    fn runs_against_saved_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.rlog");
        two_islands().save_to_file(&path).unwrap();
        run(&path, None, true, "json").unwrap();
        assert!(matches!(
            run(&dir.path().join("missing"), None, false, "text"),
            Err(CommandError::NotFound(_))
        ));
    }
}
