//! Flow hash router
//!
//! Owns one bounded queue per shard and dispatches each unit of work to
//! `hash(flow) & (N - 1)`. A full queue blocks the caller: that is the
//! intended backpressure path from slow sinks all the way back to the
//! capture handle.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::core::flow::NetFlow;
use crate::core::frame::Frame;

#[derive(Clone)]
pub struct Router {
    shards: Vec<Sender<Frame>>,
    mask: usize,
}

impl Router {
    /// Build a router with `num_shards` queues of `depth` entries each.
    /// `num_shards` must be a power of two (validated at config time).
    pub fn new(num_shards: usize, depth: usize) -> (Self, Vec<Receiver<Frame>>) {
        debug_assert!(num_shards.is_power_of_two());
        let mut shards = Vec::with_capacity(num_shards);
        let mut receivers = Vec::with_capacity(num_shards);
        for _ in 0..num_shards {
            let (tx, rx) = bounded(depth);
            shards.push(tx);
            receivers.push(rx);
        }
        (
            Self {
                shards,
                mask: num_shards - 1,
            },
            receivers,
        )
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Blocking dispatch. Returns false once the target queue has closed,
    /// which only happens during shutdown.
    pub fn dispatch(&self, flow: &NetFlow, frame: Frame) -> bool {
        self.shards[flow.shard(self.mask)].send(frame).is_ok()
    }
}
