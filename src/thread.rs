//! Thread Builder (C3).
//!
//! Buckets normalized messages by `conversation_id`, orders each bucket by
//! `received_at`, and filters obvious service traffic before evidence
//! splitting ever sees it.

use crate::types::NormalizedMessage;

/// Threads deeper than this are down-sampled to their most recent messages,
/// keeping the extractor's per-message workload bounded on long-running
/// conversations.
const MAX_THREAD_DEPTH: usize = 20;

/// Sender-local prefix that marks delivery-status / bounce traffic.
const SERVICE_SENDER_PREFIX: &str = "postmaster@";

/// Subject substrings that mark non-human, non-actionable system mail.
const SERVICE_SUBJECT_MARKERS: &[&str] = &["undeliverable", "delivery status notification", "недоставлено"];

/// One conversation's messages, ordered oldest-first, truncated to the most
/// recent [`MAX_THREAD_DEPTH`] when the raw thread runs deeper.
#[derive(Debug, Clone)]
pub struct Thread {
    /// The shared `conversation_id` of every message in this thread.
    pub conversation_id: String,
    /// Messages in chronological order.
    pub messages: Vec<NormalizedMessage>,
}

/// Group normalized messages into threads, ordered and filtered per spec §4.3.
#[must_use]
pub fn build_threads(messages: Vec<NormalizedMessage>) -> Vec<Thread> {
    let mut by_conversation: Vec<(String, Vec<NormalizedMessage>)> = Vec::new();

    for message in messages {
        if is_service_traffic(&message) {
            continue;
        }
        let conversation_id = message.message.conversation_id.clone();
        match by_conversation
            .iter_mut()
            .find(|(id, _)| *id == conversation_id)
        {
            Some((_, bucket)) => bucket.push(message),
            None => by_conversation.push((conversation_id, vec![message])),
        }
    }

    by_conversation
        .into_iter()
        .map(|(conversation_id, mut bucket)| {
            bucket.sort_by(|a, b| a.message.received_at.cmp(&b.message.received_at));
            if bucket.len() > MAX_THREAD_DEPTH {
                let skip = bucket.len().saturating_sub(MAX_THREAD_DEPTH);
                bucket.drain(..skip);
            }
            Thread {
                conversation_id,
                messages: bucket,
            }
        })
        .collect()
}

fn is_service_traffic(message: &NormalizedMessage) -> bool {
    if message.message.is_auto_submitted {
        return true;
    }
    let sender_lower = message.message.sender.to_ascii_lowercase();
    if sender_lower.starts_with(SERVICE_SENDER_PREFIX) {
        return true;
    }
    let subject_lower = message.message.subject.to_ascii_lowercase();
    SERVICE_SUBJECT_MARKERS
        .iter()
        .any(|marker| subject_lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use chrono::{TimeZone, Timelike, Utc};

    fn message(msg_id: &str, conversation_id: &str, minute: u32) -> NormalizedMessage {
        NormalizedMessage {
            message: Message {
                msg_id: msg_id.to_owned(),
                conversation_id: conversation_id.to_owned(),
                received_at: Utc.with_ymd_and_hms(2026, 7, 30, 10, minute, 0).unwrap(),
                sender: "alice@corp.com".to_owned(),
                to: vec!["bob@corp.com".to_owned()],
                cc: Vec::new(),
                subject: "Budget review".to_owned(),
                raw_body: String::new(),
                is_auto_submitted: false,
                changekey: "ck1".to_owned(),
                has_attachments: false,
            },
            text_body: "body".to_owned(),
            removed_spans: Vec::new(),
            checksum: "deadbeef".to_owned(),
        }
    }

    #[test]
    fn groups_by_conversation_and_orders_chronologically() {
        let messages = vec![message("m2", "c1", 5), message("m1", "c1", 1)];
        let threads = build_threads(messages);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].messages[0].message.msg_id, "m1");
        assert_eq!(threads[0].messages[1].message.msg_id, "m2");
    }

    #[test]
    fn filters_postmaster_traffic() {
        let mut bounce = message("m1", "c1", 1);
        bounce.message.sender = "postmaster@corp.com".to_owned();
        let threads = build_threads(vec![bounce]);
        assert!(threads.is_empty());
    }

    #[test]
    fn filters_undeliverable_subject() {
        let mut bounce = message("m1", "c1", 1);
        bounce.message.subject = "Undeliverable: Budget review".to_owned();
        let threads = build_threads(vec![bounce]);
        assert!(threads.is_empty());
    }

    #[test]
    fn downsamples_deep_threads_to_most_recent() {
        let messages: Vec<_> = (0..25).map(|i| message("m", "c1", i)).collect();
        let threads = build_threads(messages);
        assert_eq!(threads[0].messages.len(), MAX_THREAD_DEPTH);
        assert_eq!(threads[0].messages.last().unwrap().message.received_at.minute(), 24);
    }
}
