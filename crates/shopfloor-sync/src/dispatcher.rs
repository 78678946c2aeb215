//! # Priority Dispatcher
//!
//! Four outbound lanes, drained by urgency, with batching for the two
//! low-urgency lanes.
//!
//! ## Lane Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Outbound Lanes                                   │
//! │                                                                         │
//! │  send(msg, priority)                                                   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────────────┐  ┌──────────────────┐│
//! │  │ CRITICAL │  │   HIGH   │  │     NORMAL       │  │       LOW        ││
//! │  │ (Andon)  │  │ (cmds)   │  │ [m1 m2 ... m10]  │  │ [t1 t2 ...]      ││
//! │  └────┬─────┘  └────┬─────┘  └────────┬─────────┘  └────────┬─────────┘│
//! │       │ one frame   │ one frame       │ batch_size reached  │          │
//! │       │ per message │ per message     │ or batch_timeout    │          │
//! │       ▼             ▼                 ▼                     ▼          │
//! │  ════════════════ socket (critical first, low last) ═════════════════  │
//! │                                                                         │
//! │  OVERFLOW: total > max_queued_messages → drop oldest of the lowest     │
//! │            non-empty lane                                              │
//! │  WRITE FAILURE: frame goes back to the front of its lane; dropped      │
//! │                 after max_message_retries                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatcher is plain data owned by the connection actor. It never
//! touches the socket or the clock; callers pass `now` in.

use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, warn};

use shopfloor_core::{Envelope, Priority};

use crate::config::DispatchSettings;
use crate::error::SyncResult;
use crate::protocol;

// =============================================================================
// Messages & Frames
// =============================================================================

/// An envelope waiting in a lane.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub envelope: Envelope,
    pub priority: Priority,
    /// Failed write attempts so far.
    pub retries: u32,
    pub enqueued_at: Instant,
}

/// One socket write: a single message or a batch from one lane.
#[derive(Debug, Clone)]
pub struct Frame {
    pub priority: Priority,
    pub messages: Vec<OutboundMessage>,
    pub batched: bool,
}

impl Frame {
    fn single(message: OutboundMessage) -> Self {
        Frame {
            priority: message.priority,
            messages: vec![message],
            batched: false,
        }
    }

    fn batch(priority: Priority, messages: Vec<OutboundMessage>) -> Self {
        Frame {
            priority,
            messages,
            batched: true,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The envelope that goes on the wire.
    pub fn to_envelope(&self) -> SyncResult<Envelope> {
        if !self.batched {
            if let Some(message) = self.messages.first() {
                return Ok(message.envelope.clone());
            }
        }
        let envelopes: Vec<Envelope> = self.messages.iter().map(|m| m.envelope.clone()).collect();
        Ok(protocol::batch(&envelopes)?.with_priority(self.priority))
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

#[derive(Debug)]
pub struct PriorityDispatcher {
    lanes: [VecDeque<OutboundMessage>; 4],
    settings: DispatchSettings,
}

impl PriorityDispatcher {
    pub fn new(settings: DispatchSettings) -> Self {
        PriorityDispatcher {
            lanes: Default::default(),
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn lane_len(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }

    /// Queues a message. Returns the message evicted to stay within
    /// `max_queued_messages`, if any.
    pub fn enqueue(
        &mut self,
        envelope: Envelope,
        priority: Priority,
        now: Instant,
    ) -> Option<OutboundMessage> {
        let message = OutboundMessage {
            envelope: envelope.with_priority(priority),
            priority,
            retries: 0,
            enqueued_at: now,
        };
        debug!(event_type = %message.envelope.kind, %priority, "Message queued");
        self.lanes[priority.lane()].push_back(message);

        if self.len() > self.settings.max_queued_messages {
            return self.evict_one();
        }
        None
    }

    fn evict_one(&mut self) -> Option<OutboundMessage> {
        let lane = self.lanes.iter_mut().rev().find(|lane| !lane.is_empty())?;
        let evicted = lane.pop_front()?;
        warn!(
            event_type = %evicted.envelope.kind,
            priority = %evicted.priority,
            max = self.settings.max_queued_messages,
            "Outbound lanes full, dropping oldest message"
        );
        Some(evicted)
    }

    /// Frames that should go out now.
    ///
    /// Critical and high messages are returned one frame each. Normal and
    /// low lanes yield full batches, plus a partial batch once the oldest
    /// buffered message has waited `batch_timeout`.
    pub fn ready_frames(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        let batch_size = self.settings.batch_size.max(1);
        let timeout = self.settings.batch_timeout();

        for priority in Priority::ALL {
            let lane = &mut self.lanes[priority.lane()];
            if !priority.is_batched() {
                frames.extend(lane.drain(..).map(Frame::single));
                continue;
            }

            while lane.len() >= batch_size {
                frames.push(Frame::batch(priority, lane.drain(..batch_size).collect()));
            }

            let expired = lane
                .front()
                .is_some_and(|oldest| oldest.enqueued_at + timeout <= now);
            if expired {
                frames.push(Frame::batch(priority, lane.drain(..).collect()));
            }
        }

        frames
    }

    /// Everything queued, strictly in priority order. Used right after a
    /// connection opens.
    pub fn drain_all(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let batch_size = self.settings.batch_size.max(1);

        for priority in Priority::ALL {
            let lane = &mut self.lanes[priority.lane()];
            if !priority.is_batched() {
                frames.extend(lane.drain(..).map(Frame::single));
                continue;
            }
            while !lane.is_empty() {
                let take = lane.len().min(batch_size);
                frames.push(Frame::batch(priority, lane.drain(..take).collect()));
            }
        }

        frames
    }

    /// When the oldest buffered normal/low message hits its batch timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.settings.batch_timeout();
        Priority::ALL
            .iter()
            .filter(|p| p.is_batched())
            .filter_map(|p| self.lanes[p.lane()].front())
            .map(|oldest| oldest.enqueued_at + timeout)
            .min()
    }

    /// Puts a frame back at the front of its lane, preserving order.
    ///
    /// With `failed` set, each message's retry count goes up and messages
    /// past `max_message_retries` are dropped and returned.
    pub fn requeue(&mut self, frame: Frame, failed: bool) -> Vec<OutboundMessage> {
        let max_retries = self.settings.max_message_retries;
        let mut dropped = Vec::new();
        let lane = &mut self.lanes[frame.priority.lane()];

        for mut message in frame.messages.into_iter().rev() {
            if failed {
                message.retries += 1;
                if message.retries > max_retries {
                    warn!(
                        event_type = %message.envelope.kind,
                        retries = message.retries,
                        "Dropping message after repeated write failures"
                    );
                    dropped.push(message);
                    continue;
                }
            }
            lane.push_front(message);
        }

        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn settings(batch_size: usize, max_queued: usize) -> DispatchSettings {
        DispatchSettings {
            batch_size,
            batch_timeout_ms: 100,
            max_queued_messages: max_queued,
            max_message_retries: 2,
        }
    }

    fn msg(n: usize) -> Envelope {
        Envelope::new("counter", json!({ "n": n }))
    }

    #[test]
    fn test_critical_and_high_go_out_unbatched_critical_first() {
        let now = Instant::now();
        let mut d = PriorityDispatcher::new(settings(10, 100));
        d.enqueue(msg(1), Priority::High, now);
        d.enqueue(msg(2), Priority::Critical, now);
        d.enqueue(msg(3), Priority::Normal, now);

        let frames = d.ready_frames(now);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].priority, Priority::Critical);
        assert_eq!(frames[1].priority, Priority::High);
        assert!(!frames[0].batched);
        assert_eq!(d.lane_len(Priority::Normal), 1);
    }

    #[test]
    fn test_twelve_normal_messages_make_batches_of_ten_and_two() {
        let start = Instant::now();
        let mut d = PriorityDispatcher::new(settings(10, 100));
        for n in 0..12 {
            d.enqueue(msg(n), Priority::Normal, start);
        }

        let first = d.ready_frames(start);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].len(), 10);
        assert!(first[0].batched);

        assert_eq!(d.next_deadline(), Some(start + Duration::from_millis(100)));
        assert!(d.ready_frames(start + Duration::from_millis(50)).is_empty());

        let second = d.ready_frames(start + Duration::from_millis(100));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].len(), 2);
        assert!(d.is_empty());
        assert_eq!(d.next_deadline(), None);
    }

    #[test]
    fn test_batch_envelope_wraps_messages() {
        let now = Instant::now();
        let mut d = PriorityDispatcher::new(settings(2, 100));
        d.enqueue(msg(1), Priority::Low, now);
        d.enqueue(msg(2), Priority::Low, now);

        let frame = d.ready_frames(now).remove(0);
        let envelope = frame.to_envelope().unwrap();
        assert_eq!(envelope.kind, protocol::BATCH);
        assert_eq!(envelope.priority, Some(Priority::Low));
        let messages = envelope.field("messages").unwrap().as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["data"]["n"], json!(1));
        assert_eq!(messages[0]["priority"], json!(4));
    }

    #[test]
    fn test_overflow_evicts_oldest_of_lowest_lane() {
        let now = Instant::now();
        let mut d = PriorityDispatcher::new(settings(10, 3));
        d.enqueue(msg(1), Priority::Low, now);
        d.enqueue(msg(2), Priority::Low, now);
        d.enqueue(msg(3), Priority::Critical, now);

        let evicted = d.enqueue(msg(4), Priority::High, now).unwrap();
        assert_eq!(evicted.envelope.data["n"], json!(1));
        assert_eq!(d.len(), 3);
        assert_eq!(d.lane_len(Priority::Low), 1);
    }

    #[test]
    fn test_drain_all_in_priority_order() {
        let now = Instant::now();
        let mut d = PriorityDispatcher::new(settings(2, 100));
        d.enqueue(msg(1), Priority::Low, now);
        d.enqueue(msg(2), Priority::Normal, now);
        d.enqueue(msg(3), Priority::Normal, now);
        d.enqueue(msg(4), Priority::Normal, now);
        d.enqueue(msg(5), Priority::High, now);

        let order: Vec<(Priority, usize)> =
            d.drain_all().iter().map(|f| (f.priority, f.len())).collect();
        assert_eq!(
            order,
            vec![
                (Priority::High, 1),
                (Priority::Normal, 2),
                (Priority::Normal, 1),
                (Priority::Low, 1)
            ]
        );
    }

    #[test]
    fn test_requeue_keeps_order_and_drops_after_retries() {
        let now = Instant::now();
        let mut d = PriorityDispatcher::new(settings(3, 100));
        for n in 0..3 {
            d.enqueue(msg(n), Priority::Normal, now);
        }

        let mut frame = d.ready_frames(now).remove(0);
        for _ in 0..2 {
            assert!(d.requeue(frame, true).is_empty());
            frame = d.ready_frames(now).remove(0);
        }
        let ns: Vec<_> = frame.messages.iter().map(|m| m.envelope.data["n"].clone()).collect();
        assert_eq!(ns, vec![json!(0), json!(1), json!(2)]);

        let dropped = d.requeue(frame, true);
        assert_eq!(dropped.len(), 3);
        assert!(d.is_empty());
    }

    #[test]
    fn test_requeue_unsent_does_not_count_retry() {
        let now = Instant::now();
        let mut d = PriorityDispatcher::new(settings(10, 100));
        d.enqueue(msg(1), Priority::High, now);
        let frame = d.ready_frames(now).remove(0);
        d.requeue(frame, false);
        let frame = d.ready_frames(now).remove(0);
        assert_eq!(frame.messages[0].retries, 0);
    }
}
