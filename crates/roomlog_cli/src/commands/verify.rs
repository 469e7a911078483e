//! Verify command implementation.

use super::{open, select_rooms, CommandError};
use roomlog_core::SegmentOrderIndex;
use roomlog_store::Tables;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Verification result for one room.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of segments checked.
    pub segments_checked: usize,
    /// Number of events checked.
    pub events_checked: usize,
    /// List of problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, room: Option<&str>) -> Result<(), CommandError> {
    println!("Verifying snapshot at {path:?}");
    println!();

    let store = open(path)?;
    let read = store.begin_read();
    let mut problems = 0;
    for room_id in select_rooms(read.room_ids(), room)? {
        let result = verify_room(&read, &room_id);
        print_result(&room_id, &result);
        problems += result.errors.len();
    }

    println!();
    if problems == 0 {
        println!("✓ Snapshot verification passed");
        Ok(())
    } else {
        println!("✗ Snapshot verification failed");
        Err(CommandError::VerificationFailed(problems))
    }
}

/// Checks one room's segment chain, event index and relations.
pub fn verify_room(tables: &Tables, room_id: &str) -> VerifyResult {
    let mut result = VerifyResult::default();
    let segments = tables.segments(room_id);
    result.segments_checked = segments.len();

    for segment in &segments {
        if let Some(next) = segment.next_id {
            match tables.segment(room_id, next) {
                Some(n) if n.previous_id == Some(segment.id) => {}
                Some(_) => result.errors.push(format!(
                    "segment {} links forward to {next}, which doesn't link back",
                    segment.id
                )),
                None => result.errors.push(format!(
                    "segment {} links forward to missing segment {next}",
                    segment.id
                )),
            }
        }
        if let Some(previous) = segment.previous_id {
            match tables.segment(room_id, previous) {
                Some(p) if p.next_id == Some(segment.id) => {}
                Some(_) => result.errors.push(format!(
                    "segment {} links back to {previous}, which doesn't link forward",
                    segment.id
                )),
                None => result.errors.push(format!(
                    "segment {} links back to missing segment {previous}",
                    segment.id
                )),
            }
        }
        if segment.previous_id.is_some() && segment.previous_token.is_some() {
            result
                .errors
                .push(format!("segment {} has both a predecessor and a gap token", segment.id));
        }
    }
    if let Err(err) = SegmentOrderIndex::from_segments(room_id, &segments) {
        result.errors.push(format!("islands can't be built: {err}"));
    }

    let known: HashSet<_> = segments.iter().map(|s| s.id).collect();
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for record in tables.room_events(room_id) {
        result.events_checked += 1;
        if !known.contains(&record.segment_id) {
            result.errors.push(format!(
                "event {} sits in missing segment {}",
                record.event_id(),
                record.segment_id
            ));
        }
        *seen.entry(record.event_id()).or_default() += 1;
    }
    for (event_id, count) in seen.iter().filter(|(_, count)| **count > 1) {
        result.errors.push(format!("event {event_id} is stored {count} times"));
    }

    for relation in tables.room_relations(room_id) {
        if !seen.contains_key(relation.source_event_id.as_str()) {
            result.errors.push(format!(
                "relation {} -> {} has no stored source event",
                relation.source_event_id, relation.target_event_id
            ));
        }
    }

    tracing::debug!(
        room_id,
        segments = result.segments_checked,
        events = result.events_checked,
        errors = result.errors.len(),
        "verified room"
    );
    result
}

fn print_result(room_id: &str, result: &VerifyResult) {
    println!("{room_id}:");
    println!("  Segments checked: {}", result.segments_checked);
    println!("  Events checked:   {}", result.events_checked);
    if result.is_ok() {
        println!("  ✓ OK");
    } else {
        println!("  Errors: {}", result.errors.len());
        for err in &result.errors {
            println!("    - {err}");
        }
    }
}
