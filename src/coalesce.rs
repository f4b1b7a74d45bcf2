//! Heartbeat coalescing across groups.
//!
//! A host with N groups sharing M peers would otherwise send O(N·M)
//! heartbeat messages per tick. Leaders' heartbeats (and followers'
//! responses) for the same destination are folded into one wire frame per
//! tick, each beat still carrying its group's full term and commit signal.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::proto::Frame;
use crate::proto::GroupBeat;
use crate::proto::HeartbeatBatch;
use crate::proto::NodeId;
use crate::transport::Transport;

#[derive(Debug, Default)]
struct PendingBeats {
    /// Leader -> follower direction.
    beats: Vec<GroupBeat>,
    /// Follower -> leader direction.
    replies: Vec<GroupBeat>,
}

/// Shared by every group on a host; flushed once per tick by the server.
#[derive(Default)]
pub struct HeartbeatCoalescer {
    node: NodeId,
    pending: Mutex<HashMap<NodeId, PendingBeats>>,
}

impl HeartbeatCoalescer {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queue one group's heartbeat for `to`.
    pub fn add(&self, to: NodeId, reply: bool, beat: GroupBeat) {
        let mut pending = self.pending.lock().unwrap();
        let entry = pending.entry(to).or_default();
        if reply {
            entry.replies.push(beat);
        } else {
            entry.beats.push(beat);
        }
    }

    /// Emit one batched frame per destination and direction.
    pub fn flush(&self, transport: &dyn Transport) {
        let drained: Vec<(NodeId, PendingBeats)> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };

        for (to, entry) in drained {
            if !entry.beats.is_empty() {
                transport.send(Frame::Heartbeats(HeartbeatBatch {
                    from: self.node,
                    to,
                    reply: false,
                    beats: entry.beats,
                }));
            }
            if !entry.replies.is_empty() {
                transport.send(Frame::Heartbeats(HeartbeatBatch {
                    from: self.node,
                    to,
                    reply: true,
                    beats: entry.replies,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct CaptureTransport {
        frames: StdMutex<Vec<Frame>>,
    }

    impl Transport for CaptureTransport {
        fn send(&self, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn beat(group: u64, term: u64, commit: u64) -> GroupBeat {
        GroupBeat { group, term, commit }
    }

    #[test]
    fn test_beats_fold_per_destination() {
        let coalescer = HeartbeatCoalescer::new(1);
        let transport = CaptureTransport::default();

        // Three groups heartbeat peer 2, one group heartbeats peer 3.
        coalescer.add(2, false, beat(10, 1, 5));
        coalescer.add(2, false, beat(11, 2, 9));
        coalescer.add(2, false, beat(12, 7, 0));
        coalescer.add(3, false, beat(10, 1, 5));

        coalescer.flush(&transport);
        let frames = transport.frames.lock().unwrap();
        assert_eq!(2, frames.len(), "one frame per destination");

        let to2 = frames
            .iter()
            .find_map(|f| match f {
                Frame::Heartbeats(b) if b.to == 2 => Some(b),
                _ => None,
            })
            .unwrap();
        assert_eq!(3, to2.beats.len());
        assert!(!to2.reply);
        assert_eq!(1, to2.from);
    }

    #[test]
    fn test_replies_and_beats_stay_separate() {
        let coalescer = HeartbeatCoalescer::new(2);
        let transport = CaptureTransport::default();

        coalescer.add(1, false, beat(10, 3, 4));
        coalescer.add(1, true, beat(11, 3, 0));

        coalescer.flush(&transport);
        let frames = transport.frames.lock().unwrap();
        assert_eq!(2, frames.len());
        assert!(frames.iter().any(|f| matches!(f, Frame::Heartbeats(b) if b.reply)));
        assert!(frames.iter().any(|f| matches!(f, Frame::Heartbeats(b) if !b.reply)));
    }

    #[test]
    fn test_flush_clears_pending() {
        let coalescer = HeartbeatCoalescer::new(1);
        let transport = CaptureTransport::default();

        coalescer.add(2, false, beat(10, 1, 5));
        coalescer.flush(&transport);
        coalescer.flush(&transport);

        assert_eq!(1, transport.frames.lock().unwrap().len());
    }
}
