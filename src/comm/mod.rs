//! Communication Context
//!
//! The exchange algorithms only need point-to-point messages, a barrier and a
//! max-reduction. [`Communicator`] is that capability set; every component
//! receives it explicitly instead of querying global state.
//!
//! Payloads are opaque `f32` vectors. Sends are buffered: `isend` copies the
//! payload and completes without waiting for the matching receive.

pub mod local;

pub use local::{LocalCluster, LocalEndpoint};

use crate::error::Result;

/// Tag of all block exchange messages
pub const EXCHANGE_TAG: u32 = 0;

/// A non-blocking operation that has been issued but not yet waited for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Send { dest: usize, tag: u32 },
    Recv { source: usize, tag: u32 },
}

/// Outcome of a finished request
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Sent { dest: usize },
    Received { source: usize, payload: Vec<f32> },
}

/// Bounded set of outstanding requests used with [`Communicator::wait_any`]
#[derive(Debug, Default)]
pub struct RequestSet {
    pending: Vec<Request>,
}

impl RequestSet {
    pub fn with_capacity(capacity: usize) -> Self {
        RequestSet {
            pending: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, request: Request) {
        self.pending.push(request);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn requests(&self) -> &[Request] {
        &self.pending
    }

    /// Position of the first pending send
    pub fn first_send(&self) -> Option<usize> {
        self.pending
            .iter()
            .position(|r| matches!(r, Request::Send { .. }))
    }

    /// Position of the pending receive matching a message header
    pub fn find_recv(&self, source: usize, tag: u32) -> Option<usize> {
        self.pending
            .iter()
            .position(|r| *r == Request::Recv { source, tag })
    }

    pub fn take(&mut self, position: usize) -> Request {
        self.pending.swap_remove(position)
    }
}

/// Message counters of one endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransferStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub values_sent: u64,
    pub values_received: u64,
}

/// Point-to-point and collective operations of one rank
pub trait Communicator {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Blocking send; returns once the payload is handed to the transport
    fn send(&self, dest: usize, tag: u32, payload: &[f32]) -> Result<()>;

    /// Blocking receive of the next message from `source` with `tag`
    fn recv(&self, source: usize, tag: u32) -> Result<Vec<f32>>;

    /// Non-blocking send
    fn isend(&self, dest: usize, tag: u32, payload: &[f32]) -> Result<Request>;

    /// Non-blocking receive; the payload is delivered by `wait_any`
    fn irecv(&self, source: usize, tag: u32) -> Request {
        Request::Recv { source, tag }
    }

    /// Block until one request of `requests` finishes and remove it.
    ///
    /// Returns `None` when the set is empty.
    fn wait_any(&self, requests: &mut RequestSet) -> Result<Option<Completion>>;

    fn barrier(&self) -> Result<()>;

    /// Maximum of `value` over all ranks, available on every rank
    fn all_reduce_max(&self, value: f64) -> Result<f64>;

    fn stats(&self) -> TransferStats {
        TransferStats::default()
    }

    /// Send to `dest` and receive from `source` in one call
    fn send_recv(&self, dest: usize, payload: &[f32], source: usize, tag: u32) -> Result<Vec<f32>> {
        self.send(dest, tag, payload)?;
        self.recv(source, tag)
    }

    /// Wait for every request in the set, handing each completion to `on_complete`
    fn wait_all(
        &self,
        requests: &mut RequestSet,
        on_complete: &mut dyn FnMut(Completion) -> Result<()>,
    ) -> Result<()> {
        while let Some(completion) = self.wait_any(requests)? {
            on_complete(completion)?;
        }
        Ok(())
    }
}
