//! Recency queue over an arena of flow records.
//!
//! The classic intrusive doubly linked list (each record is both a map value
//! and a list node) is expressed as an arena of records addressed by stable
//! handles: the hash map stores key→handle and the queue stores handle-based
//! prev/next links. All operations are O(1).
//!
//! `remove` is a safe no-op when the node is not currently linked; the
//! eviction sweep and the resolve path can both touch a node without
//! coordinating, and a double remove must never corrupt the list.

use crate::core::FlowStats;

/// Stable index of a flow record in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHandle(u32);

struct Node {
    stats: FlowStats,
    prev: Option<FlowHandle>,
    next: Option<FlowHandle>,
    linked: bool,
}

/// Slot arena with a free list; handles stay valid until `release`.
pub struct FlowArena {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
}

impl FlowArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, stats: FlowStats) -> FlowHandle {
        let node = Node {
            stats,
            prev: None,
            next: None,
            linked: false,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(node);
                FlowHandle(idx)
            }
            None => {
                self.slots.push(Some(node));
                FlowHandle((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Free the slot and hand the record back by value.
    ///
    /// The caller must have unlinked the handle from the queue and the map
    /// first; the table is the only caller and does both.
    pub fn release(&mut self, handle: FlowHandle) -> FlowStats {
        let node = self.slots[handle.0 as usize]
            .take()
            .expect("released flow handle twice");
        self.free.push(handle.0);
        node.stats
    }

    pub fn stats(&self, handle: FlowHandle) -> &FlowStats {
        &self.node(handle).stats
    }

    pub fn stats_mut(&mut self, handle: FlowHandle) -> &mut FlowStats {
        &mut self.node_mut(handle).stats
    }

    fn node(&self, handle: FlowHandle) -> &Node {
        self.slots[handle.0 as usize]
            .as_ref()
            .expect("stale flow handle")
    }

    fn node_mut(&mut self, handle: FlowHandle) -> &mut Node {
        self.slots[handle.0 as usize]
            .as_mut()
            .expect("stale flow handle")
    }
}

impl Default for FlowArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Doubly linked list of in-flight flows, most recently touched at the head.
pub struct RecencyQueue {
    head: Option<FlowHandle>,
    tail: Option<FlowHandle>,
    count: usize,
}

impl RecencyQueue {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
        }
    }

    /// Insert at the head. The handle must not already be linked.
    pub fn add(&mut self, arena: &mut FlowArena, handle: FlowHandle) {
        debug_assert!(!arena.node(handle).linked, "added a linked flow twice");
        match self.head {
            None => {
                let node = arena.node_mut(handle);
                node.prev = None;
                node.next = None;
                self.tail = Some(handle);
            }
            Some(old_head) => {
                arena.node_mut(handle).prev = None;
                arena.node_mut(handle).next = Some(old_head);
                arena.node_mut(old_head).prev = Some(handle);
            }
        }
        arena.node_mut(handle).linked = true;
        self.head = Some(handle);
        self.count += 1;
    }

    /// Detach from anywhere in the list. No-op if the node is not linked.
    pub fn remove(&mut self, arena: &mut FlowArena, handle: FlowHandle) {
        if !arena.node(handle).linked {
            return;
        }
        let (prev, next) = {
            let node = arena.node(handle);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => arena.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = arena.node_mut(handle);
        node.prev = None;
        node.next = None;
        node.linked = false;
        self.count -= 1;
    }

    /// Move an existing node to the head.
    pub fn promote(&mut self, arena: &mut FlowArena, handle: FlowHandle) {
        self.remove(arena, handle);
        self.add(arena, handle);
    }

    pub fn head(&self) -> Option<FlowHandle> {
        self.head
    }

    pub fn tail(&self) -> Option<FlowHandle> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for RecencyQueue {
    fn default() -> Self {
        Self::new()
    }
}
