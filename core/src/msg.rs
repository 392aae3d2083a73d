//! Cross-CPU message bus: one FIFO queue per physical hart, carrying the
//! tagged-enum messages LINE uses to forward a line-recompute request to
//! the hart that actually owns the target vhart.
//!
//! Grounded on the bounded ring-buffer channel pattern, redesigned per the
//! "no function-pointer handler tables" note into an explicit tagged enum
//! dispatched by a top-level match in the receiver's IPI path, instead of
//! a linker-registered handler table.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::platform::{PhartId, VhartId};

/// Upper bound on concurrently tracked physical harts.
pub const MAX_HARTS: usize = 256;
const QUEUE_CAPACITY: usize = 64;

/// Which subsystem should interpret [`Message::event`] + [`Message::payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgHandler {
    /// Routed to VCTRL/LINE.
    VctrlIpi,
}

/// The event code carried by a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgEvent {
    /// Recompute and apply the line state for the vhart named by `payload`.
    UpdateLine,
}

/// One inter-processor message. Delivered at most once per send; the
/// receiver executes it in its normal interrupt-servicing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Which subsystem handles this message.
    pub handler: MsgHandler,
    /// What to do.
    pub event: MsgEvent,
    /// Event-specific payload.
    pub payload: u64,
}

impl Message {
    /// Build the one message LINE ever sends: recompute vhart `vhart` on
    /// whichever hart receives it.
    pub fn update_line(vhart: VhartId) -> Self {
        Self { handler: MsgHandler::VctrlIpi, event: MsgEvent::UpdateLine, payload: vhart.0 as u64 }
    }
}

struct Queue {
    items: Mutex<VecDeque<Message>>,
}

impl Queue {
    const fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()) }
    }
}

/// Per-hart FIFO message queues. The sender enqueues and returns; actual
/// delivery to the remote hart's execution context is the platform's job
/// (typically paired with a firmware IPI so the receiver wakes up and
/// drains its queue).
pub struct MessageBus {
    queues: [Queue; MAX_HARTS],
}

impl MessageBus {
    /// Construct an empty bus.
    pub const fn new() -> Self {
        const EMPTY: Queue = Queue::new();
        Self { queues: [EMPTY; MAX_HARTS] }
    }

    /// Enqueue `msg` for `target`. Drops the message and returns `false` if
    /// the target's queue is saturated — this should not happen in
    /// practice since LINE enqueues at most one message per vhart write.
    pub fn send(&self, target: PhartId, msg: Message) -> bool {
        let mut q = self.queues[target.0].items.lock();
        if q.len() >= QUEUE_CAPACITY {
            return false;
        }
        q.push_back(msg);
        true
    }

    /// Drain every pending message addressed to `hart`, oldest first.
    pub fn drain(&self, hart: PhartId) -> alloc::vec::Vec<Message> {
        let mut q = self.queues[hart.0].items.lock();
        q.drain(..).collect()
    }

    /// Pop a single pending message for `hart`, if any.
    pub fn try_recv(&self, hart: PhartId) -> Option<Message> {
        self.queues[hart.0].items.lock().pop_front()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Global cross-CPU message bus.
pub static BUS: MessageBus = MessageBus::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_drain_is_fifo() {
        let bus = MessageBus::new();
        bus.send(PhartId(2), Message::update_line(VhartId(3)));
        bus.send(PhartId(2), Message::update_line(VhartId(4)));
        let drained = bus.drain(PhartId(2));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, 3);
        assert_eq!(drained[1].payload, 4);
        assert!(bus.try_recv(PhartId(2)).is_none());
    }

    #[test]
    fn queues_are_independent_per_hart() {
        let bus = MessageBus::new();
        bus.send(PhartId(0), Message::update_line(VhartId(1)));
        assert!(bus.try_recv(PhartId(1)).is_none());
        assert!(bus.try_recv(PhartId(0)).is_some());
    }
}
