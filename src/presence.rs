//! Presence diff/merge engine (§4.6): a stateful layer over a channel's
//! message stream, tracking a key→metas mapping the server maintains.
//!
//! There is no per-presence background actor beyond the subscriber task
//! below: the merge logic has exactly one writer (that task), so the shared
//! state is a set of `Mutex`-guarded fields rather than a command mailbox,
//! the same shape `PushShared` uses for its cheap reads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::channel::Channel;
use crate::message::Message;

/// One key's server-maintained metadata list (e.g. one entry per tab/device
/// a user is joined from).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceEntry {
    pub metas: Vec<Value>,
}

fn phx_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}

#[derive(Debug, Clone, Default)]
struct Diff {
    joins: HashMap<String, PresenceEntry>,
    leaves: HashMap<String, PresenceEntry>,
}

fn parse_state(payload: &Value) -> HashMap<String, PresenceEntry> {
    payload
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), parse_entry(v))).collect())
        .unwrap_or_default()
}

fn parse_entry(value: &Value) -> PresenceEntry {
    let metas = value.get("metas").and_then(Value::as_array).cloned().unwrap_or_default();
    PresenceEntry { metas }
}

fn parse_diff(payload: &Value) -> Diff {
    Diff {
        joins: payload.get("joins").map(parse_state).unwrap_or_default(),
        leaves: payload.get("leaves").map(parse_state).unwrap_or_default(),
    }
}

/// Replace `current` with `new_state`, returning the joins/leaves the merge
/// rule derives for callback purposes (§4.6's state-snapshot merge rule).
fn merge_state(
    current: &HashMap<String, PresenceEntry>,
    new_state: HashMap<String, PresenceEntry>,
) -> (HashMap<String, PresenceEntry>, Vec<(String, PresenceEntry)>, Vec<(String, PresenceEntry)>) {
    let mut joins = Vec::new();
    let mut leaves = Vec::new();

    for (key, new_entry) in &new_state {
        match current.get(key) {
            None => joins.push((key.clone(), new_entry.clone())),
            Some(old_entry) => {
                let old_refs: HashSet<&str> = old_entry.metas.iter().filter_map(phx_ref).collect();
                let new_refs: HashSet<&str> = new_entry.metas.iter().filter_map(phx_ref).collect();
                let joined_metas: Vec<Value> = new_entry
                    .metas
                    .iter()
                    .filter(|m| phx_ref(m).is_none_or(|r| !old_refs.contains(r)))
                    .cloned()
                    .collect();
                let left_metas: Vec<Value> = old_entry
                    .metas
                    .iter()
                    .filter(|m| phx_ref(m).is_none_or(|r| !new_refs.contains(r)))
                    .cloned()
                    .collect();
                if !joined_metas.is_empty() {
                    joins.push((key.clone(), PresenceEntry { metas: joined_metas }));
                }
                if !left_metas.is_empty() {
                    leaves.push((key.clone(), PresenceEntry { metas: left_metas }));
                }
            }
        }
    }
    for (key, old_entry) in current {
        if !new_state.contains_key(key) {
            leaves.push((key.clone(), old_entry.clone()));
        }
    }

    (new_state, joins, leaves)
}

/// Apply a `{joins, leaves}` diff to `current` in place, returning the
/// joins/leaves for callback purposes (§4.6's diff-apply rule).
///
/// A join's stated metas win over the previous record for any overlapping
/// `phx_ref`; non-overridden previous metas are kept, appended after the
/// incoming ones (confirmed by the worked presence-sync example: a fresh
/// `phx_ref` sorts before the carried-over one).
fn merge_diff(current: &mut HashMap<String, PresenceEntry>, diff: &Diff) -> (Vec<(String, PresenceEntry)>, Vec<(String, PresenceEntry)>) {
    let mut joins = Vec::new();
    for (key, joined_entry) in &diff.joins {
        let mut metas = joined_entry.metas.clone();
        if let Some(old_entry) = current.get(key) {
            let incoming_refs: HashSet<&str> = joined_entry.metas.iter().filter_map(phx_ref).collect();
            metas.extend(
                old_entry
                    .metas
                    .iter()
                    .filter(|m| phx_ref(m).is_none_or(|r| !incoming_refs.contains(r)))
                    .cloned(),
            );
        }
        current.insert(key.clone(), PresenceEntry { metas });
        joins.push((key.clone(), joined_entry.clone()));
    }

    let mut leaves = Vec::new();
    for (key, left_entry) in &diff.leaves {
        if let Some(entry) = current.get_mut(key) {
            let leaving_refs: HashSet<&str> = left_entry.metas.iter().filter_map(phx_ref).collect();
            entry.metas.retain(|m| phx_ref(m).is_none_or(|r| !leaving_refs.contains(r)));
            if entry.metas.is_empty() {
                current.remove(key);
            }
        }
        leaves.push((key.clone(), left_entry.clone()));
    }

    (joins, leaves)
}

type JoinCallback = Box<dyn Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync>;
type LeaveCallback = Box<dyn Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync>;
type SyncCallback = Box<dyn Fn() + Send + Sync>;

struct PresenceShared {
    state: Mutex<HashMap<String, PresenceEntry>>,
    pending_diffs: Mutex<Vec<Diff>>,
    last_state_join_ref: Mutex<Option<String>>,
    on_join: Mutex<Vec<JoinCallback>>,
    on_leave: Mutex<Vec<LeaveCallback>>,
    on_sync: Mutex<Vec<SyncCallback>>,
    disposed: AtomicBool,
}

impl PresenceShared {
    fn fire_join(&self, key: &str, joined: &PresenceEntry) {
        let current = self.state.lock().unwrap().get(key).cloned().unwrap_or_default();
        for cb in self.on_join.lock().unwrap().iter() {
            cb(key, &current, joined);
        }
    }

    fn fire_leave(&self, key: &str, left: &PresenceEntry) {
        let current = self.state.lock().unwrap().get(key).cloned().unwrap_or_default();
        for cb in self.on_leave.lock().unwrap().iter() {
            cb(key, &current, left);
        }
    }

    fn fire_sync(&self) {
        for cb in self.on_sync.lock().unwrap().iter() {
            cb();
        }
    }

    fn apply_state(&self, new_state: HashMap<String, PresenceEntry>) {
        let (merged, joins, leaves) = {
            let current = self.state.lock().unwrap();
            merge_state(&current, new_state)
        };
        *self.state.lock().unwrap() = merged;
        for (key, joined) in &joins {
            self.fire_join(key, joined);
        }
        for (key, left) in &leaves {
            self.fire_leave(key, left);
        }
        self.fire_sync();
    }

    fn apply_diff(&self, diff: &Diff) {
        let (joins, leaves) = {
            let mut current = self.state.lock().unwrap();
            merge_diff(&mut current, diff)
        };
        for (key, joined) in &joins {
            self.fire_join(key, joined);
        }
        for (key, left) in &leaves {
            self.fire_leave(key, left);
        }
        self.fire_sync();
    }
}

/// Event names a `Presence` listens for on its channel's message stream.
pub struct PresenceOptions {
    pub state_event: String,
    pub diff_event: String,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            state_event: "presence_state".to_string(),
            diff_event: "presence_diff".to_string(),
        }
    }
}

/// A diff/merge engine layered over one channel's `presence_state`/
/// `presence_diff` events.
#[derive(Clone)]
pub struct Presence {
    shared: Arc<PresenceShared>,
}

impl Presence {
    #[must_use]
    pub fn new(channel: Channel, options: PresenceOptions) -> Self {
        let shared = Arc::new(PresenceShared {
            state: Mutex::new(HashMap::new()),
            pending_diffs: Mutex::new(Vec::new()),
            last_state_join_ref: Mutex::new(None),
            on_join: Mutex::new(Vec::new()),
            on_leave: Mutex::new(Vec::new()),
            on_sync: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut messages = channel.messages().await;
            loop {
                if task_shared.disposed.load(Ordering::SeqCst) {
                    return;
                }
                match messages.recv().await {
                    Ok(message) => handle_event(&task_shared, &channel, &options, message),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Self { shared }
    }

    pub fn on_join(&self, callback: impl Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync + 'static) {
        self.shared.on_join.lock().unwrap().push(Box::new(callback));
    }

    pub fn on_leave(&self, callback: impl Fn(&str, &PresenceEntry, &PresenceEntry) + Send + Sync + 'static) {
        self.shared.on_leave.lock().unwrap().push(Box::new(callback));
    }

    pub fn on_sync(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.on_sync.lock().unwrap().push(Box::new(callback));
    }

    #[must_use]
    pub fn state(&self) -> HashMap<String, PresenceEntry> {
        self.shared.state.lock().unwrap().clone()
    }

    /// The current presence list, one entry per key, in arbitrary order.
    #[must_use]
    pub fn list(&self) -> Vec<PresenceEntry> {
        self.list_with(|_key, entry| entry.clone())
    }

    /// The current presence list, transformed by `chooser(key, entry)`.
    pub fn list_with<T>(&self, chooser: impl Fn(&str, &PresenceEntry) -> T) -> Vec<T> {
        self.shared.state.lock().unwrap().iter().map(|(k, v)| chooser(k, v)).collect()
    }

    /// Stop processing further presence events. Already-applied state is
    /// left in place; the background subscriber task exits on its next poll.
    pub fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
    }
}

fn handle_event(shared: &PresenceShared, channel: &Channel, options: &PresenceOptions, message: Message) {
    if message.event == options.state_event {
        let new_state = parse_state(&message.payload);
        shared.apply_state(new_state);
        *shared.last_state_join_ref.lock().unwrap() = channel.join_ref();

        let pending: Vec<Diff> = shared.pending_diffs.lock().unwrap().drain(..).collect();
        for diff in &pending {
            shared.apply_diff(diff);
        }
    } else if message.event == options.diff_event {
        let diff = parse_diff(&message.payload);
        let stale = channel.join_ref() != *shared.last_state_join_ref.lock().unwrap();
        if stale {
            shared.pending_diffs.lock().unwrap().push(diff);
        } else {
            shared.apply_diff(&diff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::logger::NoopLogger;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn entry(refs: &[&str]) -> PresenceEntry {
        PresenceEntry {
            metas: refs.iter().map(|r| json!({"phx_ref": r})).collect(),
        }
    }

    #[test]
    fn merge_state_classifies_joins_and_leaves() {
        let mut current = HashMap::new();
        current.insert("alice".to_string(), entry(&["a1"]));
        current.insert("bob".to_string(), entry(&["b1"]));

        let mut new_state = HashMap::new();
        new_state.insert("alice".to_string(), entry(&["a1"])); // unchanged
        new_state.insert("carol".to_string(), entry(&["c1"])); // new key

        let (merged, joins, leaves) = merge_state(&current, new_state);
        assert_eq!(merged.len(), 2);
        assert!(joins.iter().any(|(k, _)| k == "carol"));
        assert!(leaves.iter().any(|(k, _)| k == "bob"));
        assert!(!joins.iter().any(|(k, _)| k == "alice"));
    }

    #[test]
    fn merge_diff_places_fresh_metas_before_carried_over_ones() {
        // Mirrors the worked presence-sync example: state gives alice ref
        // "a1", then a diff joins alice with ref "a2".
        let mut current = HashMap::new();
        current.insert("alice".to_string(), entry(&["a1"]));

        let diff = Diff {
            joins: HashMap::from([("alice".to_string(), entry(&["a2"]))]),
            leaves: HashMap::new(),
        };
        let (joins, _leaves) = merge_diff(&mut current, &diff);

        let refs: Vec<&str> = current["alice"].metas.iter().filter_map(phx_ref).collect();
        assert_eq!(refs, vec!["a2", "a1"]);
        assert_eq!(joins.len(), 1);
    }

    #[test]
    fn merge_diff_removes_key_when_last_meta_leaves() {
        let mut current = HashMap::new();
        current.insert("alice".to_string(), entry(&["a1"]));

        let diff = Diff {
            joins: HashMap::new(),
            leaves: HashMap::from([("alice".to_string(), entry(&["a1"]))]),
        };
        merge_diff(&mut current, &diff);
        assert!(!current.contains_key("alice"));
    }

    #[test]
    fn parse_state_reads_metas_per_key() {
        let payload = json!({"alice": {"metas": [{"phx_ref": "a1", "online_at": "100"}]}});
        let state = parse_state(&payload);
        assert_eq!(state["alice"].metas.len(), 1);
        assert_eq!(state["alice"].metas[0]["online_at"], "100");
    }

    fn test_channel() -> Channel {
        struct NoopFacade;
        impl crate::channel::ChannelSocketFacade for NoopFacade {
            fn next_ref(&self) -> String {
                "1".to_string()
            }
            fn encode_and_send(
                &self,
                _message: Message,
            ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::error::PhoenixError>> + Send + 'static>> {
                Box::pin(async { Ok(()) })
            }
            fn remove_channel(&self, _topic: &str) {}
        }
        Channel::spawn(
            "room:lobby".to_string(),
            HashMap::new(),
            Duration::from_secs(1),
            Arc::new(NoopFacade),
            Arc::new(FakeClock::new()),
            Arc::new(NoopLogger),
        )
    }

    #[tokio::test]
    async fn presence_applies_state_then_diff_delivered_on_the_channel() {
        let channel = test_channel();
        let presence = Presence::new(channel.clone(), PresenceOptions::default());

        let sync_count = Arc::new(AtomicUsize::new(0));
        let sync_count2 = Arc::clone(&sync_count);
        presence.on_sync(move || {
            sync_count2.fetch_add(1, Ordering::SeqCst);
        });

        channel
            .deliver(Message::new(
                None,
                None,
                "room:lobby",
                "presence_state",
                json!({"alice": {"metas": [{"phx_ref": "a1"}]}}),
            ))
            .await;
        channel
            .deliver(Message::new(
                None,
                None,
                "room:lobby",
                "presence_diff",
                json!({"joins": {"alice": {"metas": [{"phx_ref": "a2"}]}}, "leaves": {}}),
            ))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let state = presence.state();
        let refs: Vec<&str> = state["alice"].metas.iter().filter_map(phx_ref).collect();
        assert_eq!(refs, vec!["a2", "a1"]);
        assert_eq!(sync_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_presence_events_are_ignored() {
        let channel = test_channel();
        let presence = Presence::new(channel.clone(), PresenceOptions::default());
        channel.deliver(Message::new(None, None, "room:lobby", "not_presence", json!({}))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(presence.state().is_empty());
    }
}
