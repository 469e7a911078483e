//! Relation aggregation and redaction.
//!
//! Annotations are aggregated incrementally as they arrive. Redactions
//! invalidate that bookkeeping, so an affected aggregate is recomputed from
//! every remaining relation edge instead of being patched. This tolerates
//! relations and redactions arriving in any order.

use crate::entry::{EventEntry, TimelineEntry};
use crate::error::CoreResult;
use roomlog_store::{
    AnnotationAggregate, Event, EventRecord, RelationRecord, Tables, WriteTransaction,
    ANNOTATION_RELATION,
};
use serde_json::{json, Map, Value};

/// Content fields kept when an event of the given type is redacted.
fn retained_content_keys(event_type: &str) -> &'static [&'static str] {
    match event_type {
        "m.room.member" => &["membership"],
        "m.room.create" => &["creator"],
        "m.room.join_rules" => &["join_rule"],
        "m.room.power_levels" => &[
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.history_visibility" => &["history_visibility"],
        "m.room.aliases" => &["aliases"],
        _ => &[],
    }
}

/// Strips `event` down to what survives a redaction by `redaction`.
///
/// Top-level fields kept: id, type, room id, sender, timestamp, state key.
pub fn redact_event(event: &mut Event, redaction: &Event) {
    let keep = retained_content_keys(&event.event_type);
    let content = match event.content.as_object() {
        Some(fields) => fields
            .iter()
            .filter(|(key, _)| keep.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<Map<String, Value>>(),
        None => Map::new(),
    };
    event.content = Value::Object(content);
    event.redacts = None;
    let because = serde_json::to_value(redaction).unwrap_or(Value::Null);
    event.unsigned = Some(json!({ "redacted_because": because }));
}

/// Applies relations and redactions of one room to the store.
#[derive(Debug, Clone)]
pub struct RelationWriter {
    room_id: String,
    own_user_id: String,
}

impl RelationWriter {
    /// Creates a writer for `room_id`; `own_user_id` decides the `me` flag.
    #[must_use]
    pub fn new(room_id: impl Into<String>, own_user_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            own_user_id: own_user_id.into(),
        }
    }

    /// Applies the relation carried by `source`, which has just been stored.
    ///
    /// Returns every stored event record that changed.
    pub fn apply_relation(
        &self,
        source: &EventRecord,
        txn: &mut WriteTransaction<'_>,
    ) -> CoreResult<Vec<EventRecord>> {
        if let Some(target_id) = source.event.redacted_event_id() {
            return self.apply_redaction(&source.event, target_id, txn);
        }

        let Some(relation) = source.event.relation() else {
            return Ok(Vec::new());
        };
        txn.add_relation(RelationRecord {
            room_id: self.room_id.clone(),
            target_event_id: relation.event_id.clone(),
            rel_type: relation.rel_type.clone(),
            source_event_id: source.event.event_id.clone(),
        });

        let Some(key) = relation.annotation_key() else {
            return Ok(Vec::new());
        };
        if source.event.is_redacted() {
            return Ok(Vec::new());
        }
        let Some(target) = txn.event_by_id(&self.room_id, &relation.event_id) else {
            tracing::debug!(
                room_id = %self.room_id,
                event_id = %relation.event_id,
                "annotation target not stored yet"
            );
            return Ok(Vec::new());
        };

        let mut target = target.clone();
        let aggregate = target
            .annotations
            .entry(key.to_owned())
            .or_insert(AnnotationAggregate {
                count: 0,
                me: false,
                first_timestamp: source.event.origin_server_ts,
            });
        aggregate.count += 1;
        aggregate.me |= source.event.sender == self.own_user_id;
        aggregate.first_timestamp = aggregate.first_timestamp.min(source.event.origin_server_ts);
        txn.update_event(target.clone())?;
        Ok(vec![target])
    }

    fn apply_redaction(
        &self,
        redaction: &Event,
        target_id: &str,
        txn: &mut WriteTransaction<'_>,
    ) -> CoreResult<Vec<EventRecord>> {
        let Some(target) = txn.event_by_id(&self.room_id, target_id) else {
            tracing::debug!(
                room_id = %self.room_id,
                event_id = %target_id,
                "redaction target not stored"
            );
            return Ok(Vec::new());
        };
        let mut target = target.clone();
        let relation = target.event.relation();

        redact_event(&mut target.event, redaction);
        target.annotations.clear();
        txn.update_event(target.clone())?;

        let outgoing = txn.remove_relations_from_source(&self.room_id, target_id);
        let incoming = txn.remove_relations_to_target(&self.room_id, target_id);
        tracing::debug!(
            room_id = %self.room_id,
            event_id = %target_id,
            outgoing,
            incoming,
            "redacted event"
        );

        let mut updated = vec![target];
        if let Some(relation) = relation {
            if let Some(key) = relation.annotation_key() {
                if let Some(related) = self.reaggregate(&relation.event_id, key, txn)? {
                    updated.push(related);
                }
            }
        }
        Ok(updated)
    }

    /// Recomputes the aggregate for `key` on `target_id` from scratch.
    ///
    /// Returns the updated target record, or `None` if it isn't stored.
    pub fn reaggregate(
        &self,
        target_id: &str,
        key: &str,
        txn: &mut WriteTransaction<'_>,
    ) -> CoreResult<Option<EventRecord>> {
        let Some(target) = txn.event_by_id(&self.room_id, target_id) else {
            return Ok(None);
        };
        let mut target = target.clone();
        match self.aggregate_key(target_id, key, txn) {
            Some(aggregate) => {
                target.annotations.insert(key.to_owned(), aggregate);
            }
            None => {
                target.annotations.remove(key);
            }
        }
        txn.update_event(target.clone())?;
        Ok(Some(target))
    }

    /// Fills the aggregates of a record about to be stored from relation
    /// edges that arrived before it.
    pub fn aggregate_on_arrival(&self, target: &mut EventRecord, tables: &Tables) {
        let edges = tables.relations_for_target_and_type(
            &self.room_id,
            &target.event.event_id,
            ANNOTATION_RELATION,
        );
        let mut keys: Vec<String> = edges
            .iter()
            .filter_map(|edge| tables.event_by_id(&self.room_id, &edge.source_event_id))
            .filter_map(|source| source.event.relation()?.key)
            .collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            if let Some(aggregate) = self.aggregate_key(&target.event.event_id, &key, tables) {
                target.annotations.insert(key, aggregate);
            }
        }
    }

    /// Aggregate for `key` on `target_id` derived from every stored,
    /// unredacted annotation edge.
    #[must_use]
    pub fn aggregate_key(
        &self,
        target_id: &str,
        key: &str,
        tables: &Tables,
    ) -> Option<AnnotationAggregate> {
        let mut result: Option<AnnotationAggregate> = None;
        let edges =
            tables.relations_for_target_and_type(&self.room_id, target_id, ANNOTATION_RELATION);
        for edge in edges {
            let Some(source) = tables.event_by_id(&self.room_id, &edge.source_event_id) else {
                continue;
            };
            if source.event.is_redacted() {
                continue;
            }
            let matches_key = source
                .event
                .relation()
                .is_some_and(|r| r.annotation_key() == Some(key));
            if !matches_key {
                continue;
            }
            let ts = source.event.origin_server_ts;
            let is_me = source.event.sender == self.own_user_id;
            let aggregate = result.get_or_insert(AnnotationAggregate {
                count: 0,
                me: false,
                first_timestamp: ts,
            });
            aggregate.count += 1;
            aggregate.me |= is_me;
            aggregate.first_timestamp = aggregate.first_timestamp.min(ts);
        }
        result
    }
}

/// Folds updated records into freshly written entries, or collects them as
/// updates of entries written earlier.
pub(crate) fn merge_updated_records(
    entries: &mut [TimelineEntry],
    updated: &mut Vec<EventEntry>,
    records: Vec<EventRecord>,
) {
    for record in records {
        if let Some(entry) = entries
            .iter_mut()
            .filter_map(TimelineEntry::as_event_mut)
            .find(|e| e.event_id() == record.event.event_id)
        {
            entry.update_record(record);
            continue;
        }
        if let Some(entry) = updated
            .iter_mut()
            .find(|e| e.event_id() == record.event.event_id)
        {
            entry.update_record(record);
            continue;
        }
        updated.push(EventEntry::new(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlog_store::Store;

    fn message(id: &str, sender: &str) -> Event {
        Event {
            event_id: id.into(),
            event_type: "m.room.message".into(),
            room_id: None,
            sender: sender.into(),
            origin_server_ts: 100,
            content: json!({"body": "hello", "msgtype": "m.text"}),
            state_key: None,
            unsigned: None,
            redacts: None,
        }
    }

    fn reaction(id: &str, sender: &str, target: &str, key: &str, ts: u64) -> Event {
        Event {
            event_id: id.into(),
            event_type: "m.reaction".into(),
            room_id: None,
            sender: sender.into(),
            origin_server_ts: ts,
            content: json!({
                "m.relates_to": {"rel_type": "m.annotation", "event_id": target, "key": key}
            }),
            state_key: None,
            unsigned: None,
            redacts: None,
        }
    }

    fn redaction(id: &str, target: &str) -> Event {
        Event {
            event_id: id.into(),
            event_type: "m.room.redaction".into(),
            room_id: None,
            sender: "@me:hs".into(),
            origin_server_ts: 500,
            content: json!({}),
            state_key: None,
            unsigned: None,
            redacts: Some(target.into()),
        }
    }

    fn write(
        store: &Store,
        writer: &RelationWriter,
        position: u32,
        event: Event,
    ) -> Vec<EventRecord> {
        store
            .transaction(|txn| -> CoreResult<_> {
                let record = EventRecord::new("!r", 0, position, event);
                txn.insert_event(record.clone())?;
                writer.apply_relation(&record, txn)
            })
            .unwrap()
    }

    fn aggregate(store: &Store, id: &str, key: &str) -> Option<AnnotationAggregate> {
        store
            .begin_read()
            .event_by_id("!r", id)
            .and_then(|r| r.annotations.get(key).copied())
    }

    #[test]
    fn annotations_accumulate() {
        let store = Store::new();
        let writer = RelationWriter::new("!r", "@me:hs");
        write(&store, &writer, 1, message("$t", "@a:hs"));
        let updated = write(&store, &writer, 2, reaction("$r1", "@a:hs", "$t", "👍", 20));
        assert_eq!(updated.len(), 1);
        write(&store, &writer, 3, reaction("$r2", "@me:hs", "$t", "👍", 10));

        let agg = aggregate(&store, "$t", "👍").unwrap();
        assert_eq!(agg.count, 2);
        assert!(agg.me);
        assert_eq!(agg.first_timestamp, 10);
    }

    #[test]
    fn redacting_a_reaction_decrements_by_one() {
        let store = Store::new();
        let writer = RelationWriter::new("!r", "@me:hs");
        write(&store, &writer, 1, message("$t", "@a:hs"));
        write(&store, &writer, 2, reaction("$r1", "@a:hs", "$t", "👍", 20));
        write(&store, &writer, 3, reaction("$r2", "@me:hs", "$t", "👍", 10));

        let updated = write(&store, &writer, 4, redaction("$x", "$r2"));
        assert_eq!(updated.len(), 2);
        let agg = aggregate(&store, "$t", "👍").unwrap();
        assert_eq!(agg.count, 1);
        assert!(!agg.me);
        assert_eq!(agg.first_timestamp, 20);

        write(&store, &writer, 5, redaction("$y", "$r1"));
        assert!(aggregate(&store, "$t", "👍").is_none());
    }

    #[test]
    fn redaction_strips_content_and_edges() {
        let store = Store::new();
        let writer = RelationWriter::new("!r", "@me:hs");
        write(&store, &writer, 1, message("$t", "@a:hs"));
        write(&store, &writer, 2, reaction("$r1", "@a:hs", "$t", "👍", 20));
        write(&store, &writer, 3, redaction("$x", "$t"));

        let read = store.begin_read();
        let target = read.event_by_id("!r", "$t").unwrap();
        assert!(target.event.is_redacted());
        assert_eq!(target.event.content, json!({}));
        assert_eq!(target.event.origin_server_ts, 100);
        assert_eq!(target.event.redacts, None);
        assert!(target.annotations.is_empty());
        assert!(read.relations_for_target("!r", "$t").is_empty());
    }

    #[test]
    fn member_redaction_keeps_membership() {
        let mut event = message("$m", "@a:hs");
        event.event_type = "m.room.member".into();
        event.state_key = Some("@a:hs".into());
        event.content = json!({"membership": "join", "displayname": "A"});
        redact_event(&mut event, &redaction("$x", "$m"));
        assert_eq!(event.content, json!({"membership": "join"}));
        assert_eq!(event.unsigned.unwrap()["redacted_because"]["event_id"], "$x");
    }

    #[test]
    fn redacted_redaction_loses_its_target() {
        let mut event = redaction("$x", "$t");
        event.origin_server_ts = 42;
        event.content = json!({"reason": "spam"});
        redact_event(&mut event, &redaction("$y", "$x"));
        assert_eq!(event.redacts, None);
        assert_eq!(event.redacted_event_id(), None);
        assert_eq!(event.content, json!({}));
        assert_eq!(event.origin_server_ts, 42);
        assert_eq!(event.sender, "@me:hs");
    }

    #[test]
    fn target_arriving_late_picks_up_annotations() {
        let store = Store::new();
        let writer = RelationWriter::new("!r", "@me:hs");
        write(&store, &writer, 5, reaction("$r1", "@me:hs", "$t", "🎉", 7));

        let mut target = EventRecord::new("!r", 0, 1, message("$t", "@a:hs"));
        writer.aggregate_on_arrival(&mut target, &store.begin_read());
        let agg = target.annotations["🎉"];
        assert_eq!(agg.count, 1);
        assert!(agg.me);
    }
}
