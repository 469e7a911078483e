//! Room member profiles used to annotate timeline events.
//!
//! Events are stored with the sender's display name and avatar as they were
//! when the event was sent, so later profile changes don't rewrite history.

use lru::LruCache;
use roomlog_store::{Event, MEMBER_TYPE};
use serde_json::Value;
use std::num::NonZeroUsize;

/// Profile of one room member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// User id of the member.
    pub user_id: String,
    /// Membership value (`join`, `leave`, `invite`, ...).
    pub membership: String,
    /// Display name, if set.
    pub display_name: Option<String>,
    /// Avatar URL, if set.
    pub avatar_url: Option<String>,
}

impl MemberInfo {
    fn from_content(user_id: &str, content: &Value) -> Option<Self> {
        let membership = content.get("membership")?.as_str()?;
        let text = |field: &str| content.get(field).and_then(Value::as_str).map(str::to_owned);
        Some(Self {
            user_id: user_id.to_owned(),
            membership: membership.to_owned(),
            display_name: text("displayname"),
            avatar_url: text("avatar_url"),
        })
    }

    /// Profile the member has after `event`.
    #[must_use]
    pub fn from_member_event(event: &Event) -> Option<Self> {
        if event.event_type != MEMBER_TYPE {
            return None;
        }
        Self::from_content(event.state_key.as_deref()?, &event.content)
    }

    /// Profile the member had before `event` replaced it.
    #[must_use]
    pub fn from_replacing_event(event: &Event) -> Option<Self> {
        if event.event_type != MEMBER_TYPE {
            return None;
        }
        Self::from_content(event.state_key.as_deref()?, event.prev_content()?)
    }
}

/// A membership transition produced while writing the live timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberChange {
    /// The member after the change.
    pub member: MemberInfo,
    /// Membership before the change, if known.
    pub previous_membership: Option<String>,
}

impl MemberChange {
    /// Returns true if the member joined with this change.
    #[must_use]
    pub fn has_joined(&self) -> bool {
        self.member.membership == "join" && self.previous_membership.as_deref() != Some("join")
    }

    /// Returns true if the member left with this change.
    #[must_use]
    pub fn has_left(&self) -> bool {
        self.member.membership != "join" && self.previous_membership.as_deref() == Some("join")
    }
}

/// Finds the profile of `user_id` at the event at `index` of `events`.
///
/// Looks for the nearest preceding member event for the user, then for the
/// nearest following one and uses the content it replaced, and finally for
/// a member event in the batch's `state` block.
#[must_use]
pub fn find_member_in_batch(
    user_id: &str,
    events: &[Event],
    index: usize,
    state: &[Event],
) -> Option<MemberInfo> {
    let end = index.min(events.len());
    let preceding = events[..end]
        .iter()
        .rev()
        .filter(|e| e.is_member_event_for(user_id))
        .find_map(MemberInfo::from_member_event);
    if preceding.is_some() {
        return preceding;
    }

    let start = (index + 1).min(events.len());
    let following = events[start..]
        .iter()
        .filter(|e| e.is_member_event_for(user_id))
        .find_map(MemberInfo::from_replacing_event);
    if following.is_some() {
        return following;
    }

    state
        .iter()
        .filter(|e| e.is_member_event_for(user_id))
        .find_map(MemberInfo::from_member_event)
}

/// Small, bounded cache of recently resolved members of one room.
#[derive(Debug)]
pub struct MemberCache {
    members: LruCache<String, MemberInfo>,
}

impl MemberCache {
    /// Creates a cache holding at most `capacity` members (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            members: LruCache::new(capacity),
        }
    }

    /// Gets a member, marking it recently used.
    pub fn get(&mut self, user_id: &str) -> Option<MemberInfo> {
        self.members.get(user_id).cloned()
    }

    /// Stores a member.
    pub fn set(&mut self, member: MemberInfo) {
        self.members.put(member.user_id.clone(), member);
    }

    /// Drops every cached member.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Number of cached members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(id: &str, user: &str, name: &str, prev_name: Option<&str>) -> Event {
        let unsigned = prev_name
            .map(|n| json!({"prev_content": {"membership": "join", "displayname": n}}));
        Event {
            event_id: id.into(),
            event_type: MEMBER_TYPE.into(),
            room_id: None,
            sender: user.into(),
            origin_server_ts: 0,
            content: json!({"membership": "join", "displayname": name}),
            state_key: Some(user.into()),
            unsigned,
            redacts: None,
        }
    }

    fn message(id: &str, sender: &str) -> Event {
        Event {
            event_id: id.into(),
            event_type: "m.room.message".into(),
            room_id: None,
            sender: sender.into(),
            origin_server_ts: 0,
            content: json!({"body": "hi"}),
            state_key: None,
            unsigned: None,
            redacts: None,
        }
    }

    #[test]
    fn prefers_nearest_preceding_member_event() {
        let events = [
            member("$m1", "@a:hs", "Old", None),
            member("$m2", "@a:hs", "New", Some("Old")),
            message("$x", "@a:hs"),
        ];
        let info = find_member_in_batch("@a:hs", &events, 2, &[]).unwrap();
        assert_eq!(info.display_name.as_deref(), Some("New"));
    }

    #[test]
    fn falls_back_to_prev_content_of_following_event() {
        let events = [message("$x", "@a:hs"), member("$m", "@a:hs", "New", Some("Old"))];
        let info = find_member_in_batch("@a:hs", &events, 0, &[]).unwrap();
        assert_eq!(info.display_name.as_deref(), Some("Old"));
    }

    #[test]
    fn falls_back_to_state_block() {
        let events = [message("$x", "@a:hs")];
        let state = [member("$s", "@a:hs", "State", None)];
        let info = find_member_in_batch("@a:hs", &events, 0, &state).unwrap();
        assert_eq!(info.display_name.as_deref(), Some("State"));
        assert!(find_member_in_batch("@b:hs", &events, 0, &state).is_none());
    }

    #[test]
    fn cache_is_bounded() {
        let mut cache = MemberCache::new(2);
        for user in ["@a:hs", "@b:hs", "@c:hs"] {
            cache.set(MemberInfo {
                user_id: user.into(),
                membership: "join".into(),
                display_name: None,
                avatar_url: None,
            });
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("@a:hs").is_none());
        assert!(cache.get("@c:hs").is_some());
    }

    #[test]
    fn member_change_transitions() {
        let joined = MemberChange {
            member: MemberInfo::from_member_event(&member("$m", "@a:hs", "A", None)).unwrap(),
            previous_membership: Some("invite".into()),
        };
        assert!(joined.has_joined());
        assert!(!joined.has_left());
    }
}
