//! Flow cache keyed by directional 5-tuple.

use std::collections::HashMap;

use tracing::trace;

use crate::core::{FlowKey, FlowStats, Ticks};

use super::queue::{FlowArena, FlowHandle, RecencyQueue};

/// Cache of in-flight flows with a most-recently-touched queue.
///
/// Every live flow is present in both the key map and the recency queue.
/// `resolve` keeps the queue ordered by `last_seen` provided callers stamp
/// `last_seen` with the same packet time they resolved with, which the
/// monitor loop does for every frame.
pub struct FlowTable {
    arena: FlowArena,
    map: HashMap<FlowKey, FlowHandle>,
    queue: RecencyQueue,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            arena: FlowArena::new(),
            map: HashMap::new(),
            queue: RecencyQueue::new(),
        }
    }

    /// Look up or create the record for `key` and leave it at the queue head.
    ///
    /// Back-to-back packets of one flow dominate real traffic, so a key that
    /// already sits at the head skips both the map lookup and the relink.
    pub fn resolve(&mut self, key: &FlowKey, packet_time: Ticks) -> &mut FlowStats {
        let handle = self.resolve_handle(key, packet_time);
        self.arena.stats_mut(handle)
    }

    fn resolve_handle(&mut self, key: &FlowKey, packet_time: Ticks) -> FlowHandle {
        if let Some(head) = self.queue.head() {
            if self.arena.stats(head).key == *key {
                return head;
            }
        }
        match self.map.get(key) {
            Some(&handle) => {
                self.queue.promote(&mut self.arena, handle);
                handle
            }
            None => {
                trace!(flow = %key, "new flow");
                let handle = self.arena.alloc(FlowStats::new(*key, packet_time));
                self.map.insert(*key, handle);
                self.queue.add(&mut self.arena, handle);
                handle
            }
        }
    }

    /// Evict the least recently touched flow if it went quiet before `cutoff`.
    ///
    /// Returns the evicted record, or `None` when the table is empty or the
    /// tail flow is still fresh. Callers sweep by looping until `None`.
    pub fn expire_tail(&mut self, cutoff: Ticks) -> Option<FlowStats> {
        let tail = self.queue.tail()?;
        if self.arena.stats(tail).last_seen >= cutoff {
            return None;
        }
        Some(self.evict(tail))
    }

    /// Unconditionally evict the least recently touched flow.
    pub fn pop_tail(&mut self) -> Option<FlowStats> {
        let tail = self.queue.tail()?;
        Some(self.evict(tail))
    }

    fn evict(&mut self, handle: FlowHandle) -> FlowStats {
        self.queue.remove(&mut self.arena, handle);
        let stats = self.arena.release(handle);
        self.map.remove(&stats.key);
        stats
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}
