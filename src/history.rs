//! Bounded per-channel message log.
//!
//! A fixed-capacity ring of recently seen messages. Appends overwrite the
//! oldest entry once full; edits replace in place so a message keeps its
//! position in the timeline. The kernel owns one ring and appends every
//! inbound Message/Action before dispatch.

use std::sync::RwLock;

use crate::msg::Message;

/// Fixed-capacity circular buffer of messages.
pub struct HistoryRing {
    inner: RwLock<Ring>,
}

struct Ring {
    slots: Vec<Option<Message>>,
    /// Next slot to write.
    head: usize,
}

impl HistoryRing {
    /// Create a ring holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history ring capacity must be non-zero");
        Self {
            inner: RwLock::new(Ring {
                slots: vec![None; capacity],
                head: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().unwrap().slots.len()
    }

    /// Append a message, overwriting the entry written `capacity` appends ago.
    pub fn append(&self, msg: Message) {
        let mut ring = self.inner.write().unwrap();
        let head = ring.head;
        ring.slots[head] = Some(msg);
        ring.head = (head + 1) % ring.slots.len();
    }

    /// Find a message by kernel ID.
    pub fn find(&self, id: &str) -> Option<Message> {
        let ring = self.inner.read().unwrap();
        let found = ring.iter_newest_first().find(|m| m.id == id).cloned();
        found
    }

    /// Replace the message with `id` in place, preserving its position.
    /// Returns false when the ID is no longer (or never was) in the ring.
    pub fn edit(&self, id: &str, mut new: Message) -> bool {
        let mut ring = self.inner.write().unwrap();
        for slot in ring.slots.iter_mut() {
            if let Some(m) = slot {
                if m.id == id {
                    new.id = id.to_string();
                    *slot = Some(new);
                    return true;
                }
            }
        }
        false
    }

    /// The most recently appended message.
    pub fn last(&self) -> Option<Message> {
        let ring = self.inner.read().unwrap();
        let found = ring.iter_newest_first().next().cloned();
        found
    }

    /// The most recent message in `channel`.
    pub fn last_in_channel(&self, channel: &str) -> Option<Message> {
        let ring = self.inner.read().unwrap();
        let found = ring
            .iter_newest_first()
            .find(|m| m.channel == channel)
            .cloned();
        found
    }

    /// All messages in `channel`, newest first.
    pub fn in_channel(&self, channel: &str) -> Vec<Message> {
        let ring = self.inner.read().unwrap();
        let found: Vec<Message> = ring
            .iter_newest_first()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect();
        found
    }
}

impl Ring {
    /// Iterate occupied slots from newest to oldest.
    fn iter_newest_first(&self) -> impl Iterator<Item = &Message> {
        let n = self.slots.len();
        (1..=n)
            .map(move |i| &self.slots[(self.head + n - i) % n])
            .filter_map(|slot| slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::User;

    fn msg(channel: &str, body: &str) -> Message {
        Message::new(User::new("u1", "alice"), channel, body)
    }

    #[test]
    fn append_then_find() {
        let ring = HistoryRing::new(8);
        let m = msg("#a", "hello");
        let id = m.id.clone();
        ring.append(m);
        assert_eq!(ring.find(&id).unwrap().body, "hello");
    }

    #[test]
    fn oldest_is_evicted_after_wraparound() {
        let ring = HistoryRing::new(3);
        let first = msg("#a", "one");
        let first_id = first.id.clone();
        ring.append(first);
        for body in ["two", "three", "four"] {
            ring.append(msg("#a", body));
        }
        assert!(ring.find(&first_id).is_none());
        assert_eq!(ring.last().unwrap().body, "four");
    }

    #[test]
    fn edit_in_place_keeps_position() {
        let ring = HistoryRing::new(4);
        let m = msg("#a", "befoer");
        let id = m.id.clone();
        ring.append(m);
        ring.append(msg("#a", "latest"));

        assert!(ring.edit(&id, msg("#a", "before")));
        let found = ring.find(&id).unwrap();
        assert_eq!(found.body, "before");
        // Editing must not make the message "newest".
        assert_eq!(ring.last().unwrap().body, "latest");
        assert!(!ring.edit("no-such-id", msg("#a", "x")));
    }

    #[test]
    fn last_in_channel_scans_backward() {
        let ring = HistoryRing::new(8);
        ring.append(msg("#a", "a1"));
        ring.append(msg("#b", "b1"));
        ring.append(msg("#a", "a2"));
        assert_eq!(ring.last_in_channel("#a").unwrap().body, "a2");
        assert_eq!(ring.last_in_channel("#b").unwrap().body, "b1");
        assert!(ring.last_in_channel("#c").is_none());
    }

    #[test]
    fn in_channel_is_reverse_chronological() {
        let ring = HistoryRing::new(8);
        for body in ["a1", "a2", "a3"] {
            ring.append(msg("#a", body));
        }
        ring.append(msg("#b", "b1"));
        let got: Vec<String> = ring.in_channel("#a").into_iter().map(|m| m.body).collect();
        assert_eq!(got, vec!["a3", "a2", "a1"]);
    }
}
