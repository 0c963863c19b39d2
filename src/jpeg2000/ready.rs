//! Hand-off of finished precincts from block-coding threads to the rate
//! controller.
//!
//! Workers push onto per-resolution lock-free stacks; the single consumer
//! holding the codestream lock takes each stack whole and replays it in
//! submission order.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::image::Tile;
use super::packet::SubbandBlocks;
use super::precinct::PrecinctRef;
use crate::error::PcrdError;

/// A precinct whose code-blocks are all encoded.
#[derive(Debug)]
pub struct ReadyNotice {
    pub precinct: PrecinctRef,
    pub subbands: Vec<SubbandBlocks>,
}

struct ReadyNode {
    notice: ReadyNotice,
    next: *mut ReadyNode,
}

/// Multi-producer queue of ready notices using compare-and-swap.
pub struct ReadyQueue {
    head: AtomicPtr<ReadyNode>,
    len: AtomicUsize,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, notice: ReadyNotice) {
        let node = Box::into_raw(Box::new(ReadyNode {
            notice,
            next: ptr::null_mut(),
        }));

        // Counted before publishing so a concurrent drain never subtracts
        // more than was added.
        self.len.fetch_add(1, Ordering::Relaxed);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // The node is not shared until the exchange succeeds.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Takes every queued notice, oldest first.
    pub fn drain(&self) -> Vec<ReadyNotice> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut notices = Vec::new();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            notices.push(boxed.notice);
        }
        self.len.fetch_sub(notices.len(), Ordering::Relaxed);
        notices.reverse();
        notices
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReadyQueue {
    fn drop(&mut self) {
        self.drain();
    }
}

// Nodes are only reachable through the atomic head; ownership moves to the
// thread that swaps them out.
unsafe impl Send for ReadyQueue {}
unsafe impl Sync for ReadyQueue {}

struct ResolutionSlot {
    precincts: usize,
    submitted: AtomicUsize,
    queue: ReadyQueue,
}

struct ReadyBoard {
    // tile -> component -> resolution
    slots: Vec<Vec<Vec<ResolutionSlot>>>,
}

/// Cloneable handle that block-coding threads use to announce finished
/// precincts without taking the codestream lock.
#[derive(Clone)]
pub struct PrecinctSubmitter {
    board: Arc<ReadyBoard>,
}

impl PrecinctSubmitter {
    pub fn new(tiles: &[Tile]) -> Self {
        let slots = tiles
            .iter()
            .map(|tile| {
                tile.components
                    .iter()
                    .map(|comp| {
                        comp.resolutions
                            .iter()
                            .map(|res| ResolutionSlot {
                                precincts: res.num_precincts(),
                                submitted: AtomicUsize::new(0),
                                queue: ReadyQueue::new(),
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Self {
            board: Arc::new(ReadyBoard { slots }),
        }
    }

    fn slot(&self, precinct: &PrecinctRef) -> Option<&ResolutionSlot> {
        self.board
            .slots
            .get(precinct.tile)?
            .get(precinct.component)?
            .get(precinct.resolution)
    }

    pub fn submit(&self, precinct: PrecinctRef, subbands: Vec<SubbandBlocks>) -> Result<(), PcrdError> {
        let slot = self
            .slot(&precinct)
            .filter(|s| precinct.index < s.precincts)
            .ok_or(PcrdError::InvalidPrecinctReference)?;
        slot.submitted.fetch_add(1, Ordering::Relaxed);
        slot.queue.push(ReadyNotice { precinct, subbands });
        Ok(())
    }

    /// Precincts announced so far for one resolution.
    pub fn submitted(&self, tile: usize, component: usize, resolution: usize) -> usize {
        self.slot(&PrecinctRef::new(tile, component, resolution, 0))
            .map_or(0, |s| s.submitted.load(Ordering::Relaxed))
    }

    /// Notices waiting to be collected.
    pub fn queued(&self) -> usize {
        self.board
            .slots
            .iter()
            .flatten()
            .flatten()
            .map(|s| s.queue.len())
            .sum()
    }

    pub(crate) fn drain(&self) -> Vec<ReadyNotice> {
        let mut notices = Vec::new();
        for slot in self.board.slots.iter().flatten().flatten() {
            if !slot.queue.is_empty() {
                notices.extend(slot.queue.drain());
            }
        }
        notices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::image::{CodestreamParams, ComponentParams};
    use crate::jpeg2000::progression::ProgressionOrder;
    use std::thread;

    fn notice(index: usize) -> ReadyNotice {
        ReadyNotice {
            precinct: PrecinctRef::new(0, 0, 0, index),
            subbands: Vec::new(),
        }
    }

    #[test]
    fn test_queue_drains_in_submission_order() {
        let queue = ReadyQueue::new();
        assert!(queue.is_empty());
        for i in 0..3 {
            queue.push(notice(i));
        }
        assert_eq!(queue.len(), 3);
        let order: Vec<_> = queue.drain().iter().map(|n| n.precinct.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_queue_concurrent_producers() {
        let queue = Arc::new(ReadyQueue::new());
        let mut handles = vec![];
        for t in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    queue.push(notice(t * 100 + j));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen: Vec<_> = queue.drain().iter().map(|n| n.precinct.index).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn test_len_never_wraps_while_draining() {
        let queue = Arc::new(ReadyQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for j in 0..500 {
                        queue.push(notice(t * 500 + j));
                    }
                })
            })
            .collect();

        let mut drained = 0;
        while drained < 2000 {
            assert!(queue.len() <= 2000 - drained, "len {} after {drained} drained", queue.len());
            drained += queue.drain().len();
        }
        for handle in producers {
            handle.join().unwrap();
        }
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submitter_checks_references() {
        let params = CodestreamParams::single_tile(
            64,
            64,
            vec![ComponentParams::new(1, 1, 1).with_precincts(vec![(5, 5)])],
            1,
            ProgressionOrder::LayerResolutionComponentPosition,
        );
        let tiles = params.build_tiles().unwrap();
        let submitter = PrecinctSubmitter::new(&tiles);

        submitter.submit(PrecinctRef::new(0, 0, 1, 3), Vec::new()).unwrap();
        assert_eq!(
            submitter.submit(PrecinctRef::new(0, 0, 1, 4), Vec::new()),
            Err(PcrdError::InvalidPrecinctReference)
        );
        assert_eq!(
            submitter.submit(PrecinctRef::new(0, 1, 0, 0), Vec::new()),
            Err(PcrdError::InvalidPrecinctReference)
        );
        assert_eq!(submitter.submitted(0, 0, 1), 1);

        let clone = submitter.clone();
        thread::spawn(move || clone.submit(PrecinctRef::new(0, 0, 0, 0), Vec::new()))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(submitter.queued(), 2);
        assert_eq!(submitter.drain().len(), 2);
        assert_eq!(submitter.queued(), 0);
    }
}
