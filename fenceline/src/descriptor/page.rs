// Copyright (c) 2024 The fenceline contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use self::arena::{BlockNode, NodeArena};
pub(super) use self::arena::SlotId;
use super::{DescriptorAllocation, DescriptorPtr, HeapKind};
use crate::{
    device::{DescriptorHeap, Device},
    sync::FrameToken,
    OomError,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// One fixed-capacity descriptor heap page.
///
/// Free blocks are kept in a free-list with coalescing so that steady alloc/free churn of
/// varying sizes cannot fragment the page permanently. Freed blocks do not return to the free
/// list directly: the GPU may still be reading a descriptor at the moment the CPU releases it,
/// so a freed block sits in the stale queue until the frame that released it is confirmed
/// complete.
#[derive(Debug)]
pub(super) struct DescriptorPage {
    device: Arc<Device>,
    heap: DescriptorHeap,
    kind: HeapKind,
    capacity: u32,
    // Handles currently in the free list. Stale handles don't count until reclaimed.
    free_handles: AtomicU32,
    state: Mutex<PageState>,
}

#[derive(Debug)]
struct PageState {
    nodes: NodeArena,
    // Free blocks sorted by size in ascending order, so a best-fit is always found in
    // O(log(n)) time. The nodes' prev/next links are the by-offset index.
    free_list: Vec<SlotId>,
    // Released blocks awaiting their frame, in frame order.
    stale: VecDeque<StaleDescriptor>,
}

#[derive(Clone, Copy, Debug)]
struct StaleDescriptor {
    node: SlotId,
    frame: FrameToken,
}

impl DescriptorPage {
    pub(super) fn new(
        device: Arc<Device>,
        kind: HeapKind,
        capacity: u32,
    ) -> Result<Arc<Self>, OomError> {
        debug_assert!(capacity != 0);

        let heap = device.backend().create_descriptor_heap(kind, capacity)?;

        let mut nodes = NodeArena::new();
        let root = nodes.insert(BlockNode {
            prev: None,
            next: None,
            offset: 0,
            size: capacity,
            free: true,
        });

        Ok(Arc::new(DescriptorPage {
            device,
            heap,
            kind,
            capacity,
            free_handles: AtomicU32::new(capacity),
            state: Mutex::new(PageState {
                nodes,
                free_list: vec![root],
                stale: VecDeque::new(),
            }),
        }))
    }

    pub(super) fn kind(&self) -> HeapKind {
        self.kind
    }

    pub(super) fn free_handles(&self) -> u32 {
        self.free_handles.load(Ordering::Acquire)
    }

    pub(super) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns the GPU-visible pointer of the slot at `offset`.
    pub(super) fn descriptor_ptr(&self, offset: u32) -> DescriptorPtr {
        debug_assert!(offset < self.capacity);
        self.heap.base + u64::from(offset) * u64::from(self.heap.increment)
    }

    pub(super) fn heap(&self) -> &DescriptorHeap {
        &self.heap
    }

    /// Allocates a contiguous range of `count` descriptors, best-fit.
    ///
    /// Returns `None` if no free block is large enough; the caller then tries another page or
    /// creates one. A request exceeding the page capacity always fails fast.
    pub(super) fn allocate(self: &Arc<Self>, count: u32) -> Option<DescriptorAllocation> {
        debug_assert!(count != 0);

        if count > self.free_handles() {
            return None;
        }

        let mut state = self.state.lock();

        match state.free_list.last() {
            Some(&last) if state.nodes.get(last).size >= count => {}
            _ => return None,
        }

        // Smallest free block that still fits. On an exact size match the search can land on
        // any of the equally sized blocks; all of them fit.
        let (Ok(index) | Err(index)) = state
            .free_list
            .binary_search_by_key(&count, |&id| state.nodes.get(id).size);

        let id = state.free_list.remove(index);
        let node = state.nodes.get(id);
        debug_assert!(node.free && node.size >= count);

        // Trim the remainder off the end and return it to the free list.
        if node.size > count {
            let remainder = state.nodes.insert(BlockNode {
                prev: Some(id),
                next: node.next,
                offset: node.offset + count,
                size: node.size - count,
                free: true,
            });
            if let Some(next) = node.next {
                state.nodes.get_mut(next).prev = Some(remainder);
            }
            {
                let node = state.nodes.get_mut(id);
                node.next = Some(remainder);
                node.size = count;
            }
            Self::insert_free(&mut state, remainder);
        }

        state.nodes.get_mut(id).free = false;
        self.free_handles.fetch_sub(count, Ordering::AcqRel);
        drop(state);

        Some(DescriptorAllocation::new(self.clone(), id, node.offset, count))
    }

    /// Stages a released block for reclamation under `frame`. The free list is untouched until
    /// [`reclaim_stale`](Self::reclaim_stale) confirms the frame complete.
    pub(super) fn free(&self, node: SlotId, frame: FrameToken) {
        let mut state = self.state.lock();

        debug_assert!(!state.nodes.get(node).free, "descriptor block freed twice");

        state.stale.push_back(StaleDescriptor { node, frame });
    }

    /// Returns every stale block whose frame is at most `completed` to the free list, merging
    /// with adjacent free blocks. Returns the number of handles reclaimed; calling again with
    /// the same token is a no-op.
    pub(super) fn reclaim_stale(&self, completed: FrameToken) -> u32 {
        let mut state = self.state.lock();
        let mut reclaimed = 0;

        // Frames are non-decreasing along the queue, so stop at the first one still in flight.
        while let Some(entry) = state.stale.front().copied() {
            if entry.frame > completed {
                break;
            }
            state.stale.pop_front();

            let size = state.nodes.get(entry.node).size;
            state.nodes.get_mut(entry.node).free = true;
            let merged = Self::coalesce(&mut state, entry.node);
            Self::insert_free(&mut state, merged);

            self.free_handles.fetch_add(size, Ordering::AcqRel);
            reclaimed += size;
        }

        reclaimed
    }

    /// Inserts a free block into the by-size index.
    fn insert_free(state: &mut PageState, id: SlotId) {
        debug_assert!(!state.free_list.contains(&id));

        let size = state.nodes.get(id).size;
        let (Ok(index) | Err(index)) = state
            .free_list
            .binary_search_by_key(&size, |&id| state.nodes.get(id).size);
        state.free_list.insert(index, id);
    }

    /// Removes a free block from the by-size index.
    fn remove_free(state: &mut PageState, id: SlotId) {
        let size = state.nodes.get(id).size;

        match state
            .free_list
            .binary_search_by_key(&size, |&id| state.nodes.get(id).size)
        {
            Ok(index) => {
                // Several free blocks can share a size, and the search can land on any of
                // them; walk back to the start of the run, then forward to our ID.
                let mut index = index;
                while index > 0 && state.nodes.get(state.free_list[index - 1]).size == size {
                    index -= 1;
                }
                while state.free_list[index] != id {
                    index += 1;
                }
                state.free_list.remove(index);
            }
            Err(_) => unreachable!("free block missing from the by-size index"),
        }
    }

    /// Absorbs free neighbors of the (free) block `id` into it, removing them from both
    /// indices. Returns `id`, whose offset and size may have grown.
    fn coalesce(state: &mut PageState, id: SlotId) -> SlotId {
        debug_assert!(state.nodes.get(id).free);

        let node = state.nodes.get(id);
        if let Some(prev_id) = node.prev {
            let prev = state.nodes.get(prev_id);
            if prev.free {
                debug_assert!(prev.offset + prev.size == node.offset);
                Self::remove_free(state, prev_id);
                {
                    let node = state.nodes.get_mut(id);
                    node.prev = prev.prev;
                    node.offset = prev.offset;
                    node.size += prev.size;
                }
                if let Some(prev_prev) = prev.prev {
                    state.nodes.get_mut(prev_prev).next = Some(id);
                }
                state.nodes.remove(prev_id);
            }
        }

        let node = state.nodes.get(id);
        if let Some(next_id) = node.next {
            let next = state.nodes.get(next_id);
            if next.free {
                debug_assert!(node.offset + node.size == next.offset);
                Self::remove_free(state, next_id);
                {
                    let node = state.nodes.get_mut(id);
                    node.next = next.next;
                    node.size += next.size;
                }
                if let Some(next_next) = next.next {
                    state.nodes.get_mut(next_next).prev = Some(id);
                }
                state.nodes.remove(next_id);
            }
        }

        id
    }
}

impl Drop for DescriptorPage {
    fn drop(&mut self) {
        self.device.backend().destroy_descriptor_heap(self.heap.handle);
    }
}

#[cfg(test)]
impl DescriptorPage {
    /// Sizes of all free blocks, in ascending order.
    pub(super) fn free_block_sizes(&self) -> Vec<u32> {
        let state = self.state.lock();
        state
            .free_list
            .iter()
            .map(|&id| state.nodes.get(id).size)
            .collect()
    }

    /// Walks the whole block list and asserts the structural invariants: blocks tile the page
    /// exactly, links are consistent, no two adjacent blocks are both free, and the by-size
    /// index holds exactly the free blocks.
    pub(super) fn check_invariants(&self) {
        let state = self.state.lock();
        let mut blocks: Vec<BlockNode> = state.nodes.live().map(|(_, node)| node).collect();
        blocks.sort_by_key(|node| node.offset);

        let mut end = 0;
        let mut prev_free = false;
        for node in &blocks {
            assert_eq!(node.offset, end, "blocks must tile the page without gaps");
            assert!(node.size != 0);
            assert!(
                !(prev_free && node.free),
                "two adjacent free blocks were not coalesced"
            );
            prev_free = node.free;
            end += node.size;
        }
        assert_eq!(end, self.capacity, "blocks must cover the page exactly");

        let free_total: u32 = state
            .free_list
            .iter()
            .map(|&id| state.nodes.get(id).size)
            .sum();
        assert_eq!(free_total, self.free_handles());
        assert!(state
            .free_list
            .windows(2)
            .all(|pair| state.nodes.get(pair[0]).size <= state.nodes.get(pair[1]).size));
    }
}

mod arena {
    use std::num::NonZeroU32;

    /// One block in a page's address space, linked to its address-order neighbors.
    #[derive(Clone, Copy, Debug)]
    pub struct BlockNode {
        pub prev: Option<SlotId>,
        pub next: Option<SlotId>,
        pub offset: u32,
        pub size: u32,
        pub free: bool,
    }

    /// Block nodes for one page, allocated from a growable pool so that neighbor links are
    /// cheap integer IDs instead of pointers.
    #[derive(Debug)]
    pub struct NodeArena {
        pool: Vec<BlockNode>,
        // Unsorted list of vacated slots.
        vacant: Vec<SlotId>,
    }

    /// ID of a slot in a `NodeArena`. Kept opaque outside this module so stale IDs can't be
    /// fabricated.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SlotId(NonZeroU32);

    impl SlotId {
        fn index(self) -> usize {
            self.0.get() as usize - 1
        }
    }

    impl NodeArena {
        pub fn new() -> Self {
            NodeArena {
                pool: Vec::new(),
                vacant: Vec::new(),
            }
        }

        /// Stores `node` and returns the ID of its slot.
        pub fn insert(&mut self, node: BlockNode) -> SlotId {
            if let Some(id) = self.vacant.pop() {
                self.pool[id.index()] = node;
                id
            } else {
                self.pool.push(node);
                // SAFETY: `self.pool` is guaranteed to be non-empty.
                SlotId(unsafe { NonZeroU32::new_unchecked(self.pool.len() as u32) })
            }
        }

        /// Returns the slot with the given ID to the arena to be reused. The ID must not be
        /// used afterward.
        pub fn remove(&mut self, id: SlotId) {
            debug_assert!(!self.vacant.contains(&id));
            self.vacant.push(id);
        }

        pub fn get(&self, id: SlotId) -> BlockNode {
            debug_assert!(!self.vacant.contains(&id));
            self.pool[id.index()]
        }

        pub fn get_mut(&mut self, id: SlotId) -> &mut BlockNode {
            debug_assert!(!self.vacant.contains(&id));
            &mut self.pool[id.index()]
        }

        #[cfg(test)]
        pub fn live(&self) -> impl Iterator<Item = (SlotId, BlockNode)> + '_ {
            self.pool.iter().enumerate().filter_map(|(index, &node)| {
                // SAFETY: indices into `self.pool` are in [0, u32::MAX - 1].
                let id = SlotId(unsafe { NonZeroU32::new_unchecked(index as u32 + 1) });
                (!self.vacant.contains(&id)).then_some((id, node))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorAllocation;

    #[test]
    fn churn_never_leaks_or_fragments() {
        const CAPACITY: u32 = 128;

        let (device, _backend) = test_device!();
        let page = DescriptorPage::new(device.clone(), HeapKind::Resource, CAPACITY).unwrap();

        // Deterministic pseudo-random alloc/free churn of varying sizes.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut roll = move || {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };

        let mut live: Vec<DescriptorAllocation> = Vec::new();
        for step in 0..512 {
            let r = roll();
            if r % 3 != 0 || live.is_empty() {
                if let Some(allocation) = page.allocate(r % 7 + 1) {
                    live.push(allocation);
                }
            } else {
                let index = roll() as usize % live.len();
                live.swap_remove(index);
            }

            if step % 16 == 0 {
                let frame = device.frame_clock().advance();
                page.reclaim_stale(frame);
                page.check_invariants();
            }
        }

        // Once everything is released and reclaimed, the page must fold back into one block.
        live.clear();
        let frame = device.frame_clock().advance();
        page.reclaim_stale(frame);
        page.check_invariants();
        assert_eq!(page.free_handles(), CAPACITY);
        assert_eq!(page.free_block_sizes(), vec![CAPACITY]);
    }

    #[test]
    fn reclaim_stops_at_the_first_pending_frame() {
        let (device, _backend) = test_device!();
        let page = DescriptorPage::new(device.clone(), HeapKind::Sampler, 8).unwrap();

        let early = page.allocate(2).unwrap();
        let late = page.allocate(2).unwrap();

        device.frame_clock().advance();
        drop(early);
        device.frame_clock().advance();
        drop(late);

        // Only the entry released under frame 1 is eligible; frame 2's stays staged even
        // though it sits behind it in the queue.
        assert_eq!(page.reclaim_stale(1), 2);
        assert_eq!(page.free_handles(), 4 + 2);
        assert_eq!(page.reclaim_stale(2), 2);
        assert_eq!(page.free_handles(), 8);
        page.check_invariants();
    }
}
