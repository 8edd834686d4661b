//! Deferred event buses for combat resolution.
//!
//! Any number of parallel jobs may produce damage or noise in the same tick.
//! Producer stages return per-agent event lists which the world merges into
//! these buses at the join point; a single-threaded resolver then drains them
//! in FIFO order. Health is only ever mutated by that resolver, so concurrent
//! attackers can never race on a shared target.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::{AgentId, Position};

/// A single pending hit, applied by the damage resolver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DamageEvent {
    pub target: AgentId,
    pub amount: f32,
    /// Unit vector from attacker toward target at the moment of the hit.
    pub direction: (f32, f32),
    pub attacker: AgentId,
    pub from_player: bool,
}

/// A burst of sound that dormant zombies may react to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NoiseEvent {
    pub origin: Position,
    pub radius: f32,
    /// Remaining ticks this noise keeps rolling activations.
    pub lifetime: u8,
}

/// FIFO bus written at stage joins and drained by exactly one consumer.
///
/// Backing storage is allocated lazily on the first append and retained for
/// the lifetime of the world; draining clears the queue without releasing
/// capacity, so an accepted event is never dropped.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventBus<T> {
    queue: Option<Vec<T>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self { queue: None }
    }
}

impl<T> EventBus<T> {
    /// Create an empty bus with no backing allocation yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.as_ref().map_or(0, Vec::len)
    }

    /// Whether the bus holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a single event.
    pub fn push(&mut self, event: T) {
        self.queue.get_or_insert_with(Vec::new).push(event);
    }

    /// Merge a batch of events, preserving the batch's internal order.
    pub fn append(&mut self, events: impl IntoIterator<Item = T>) {
        let queue = self.queue.get_or_insert_with(Vec::new);
        queue.extend(events);
    }

    /// Drain all queued events in FIFO order, retaining capacity.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.queue.as_mut().map(|q| q.drain(..)).into_iter().flatten()
    }
}

/// Marker handed to external noise visualizers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NoiseMarker {
    pub origin: Position,
    pub radius: f32,
    pub tick: u64,
}

/// Diagnostic record of an applied hit, for external combat overlays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CombatDebugEvent {
    pub attacker: AgentId,
    pub target: AgentId,
    pub amount: f32,
    pub from_player: bool,
    pub tick: u64,
}

/// Append-only diagnostic queue with a hard capacity.
///
/// External renderers drain these opportunistically; when nobody is
/// listening the oldest entries are discarded so the queue never grows
/// past its cap.
#[derive(Debug, Serialize, Deserialize)]
pub struct DiagnosticsQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> DiagnosticsQueue<T> {
    /// Create a queue bounded to `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an entry, evicting the oldest when at capacity.
    pub fn record(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Hand all retained entries to a consumer, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(count: usize) -> Vec<AgentId> {
        let mut slots: SlotMap<AgentId, ()> = SlotMap::with_key();
        (0..count).map(|_| slots.insert(())).collect()
    }

    #[test]
    fn bus_allocates_lazily_and_preserves_fifo_order() {
        let mut bus = EventBus::new();
        assert!(bus.is_empty());

        bus.append([1u32, 2]);
        bus.push(3);
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.drain().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(bus.is_empty());
    }

    #[test]
    fn drained_damage_sums_independent_of_enqueue_order() {
        let ids = ids(2);
        let target = ids[0];
        let attacker = ids[1];
        let hit = |amount: f32| DamageEvent {
            target,
            amount,
            direction: (1.0, 0.0),
            attacker,
            from_player: false,
        };

        let amounts = [3.0f32, 1.5, 0.25, 7.0];
        let mut forward = EventBus::new();
        forward.append(amounts.map(hit));
        let mut reversed = EventBus::new();
        reversed.append(amounts.iter().rev().map(|&a| hit(a)));

        let total_forward: f32 = forward.drain().map(|e| e.amount).sum();
        let total_reversed: f32 = reversed.drain().map(|e| e.amount).sum();
        assert_eq!(total_forward, total_reversed);
        assert!((total_forward - amounts.iter().sum::<f32>()).abs() < 1e-6);
    }

    #[test]
    fn diagnostics_queue_never_exceeds_capacity() {
        let mut queue = DiagnosticsQueue::new(4);
        for tick in 0..10u64 {
            queue.record(NoiseMarker {
                origin: Position::new(0.0, 0.0),
                radius: 5.0,
                tick,
            });
        }
        assert_eq!(queue.len(), 4);
        let ticks: Vec<u64> = queue.drain().map(|m| m.tick).collect();
        assert_eq!(ticks, vec![6, 7, 8, 9]);
        assert!(queue.is_empty());
    }
}
