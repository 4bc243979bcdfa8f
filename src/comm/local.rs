//! In-process transport: every rank is a thread, every inbox a channel.
//!
//! Messages that arrive before a matching receive is posted are parked in a
//! per-rank stash, so receives match on (source, tag) in any order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use super::{Communicator, Completion, Request, RequestSet, TransferStats};
use crate::error::{Result, TransposeError};

#[derive(Debug)]
struct Envelope {
    source: usize,
    tag: u32,
    payload: Vec<f32>,
}

#[derive(Debug)]
struct BarrierState {
    arrived: Vec<bool>,
    count: usize,
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    barrier: Mutex<BarrierState>,
    released: Condvar,
    reduce_slots: Mutex<Vec<f64>>,
}

/// A set of ranks living in one process
#[derive(Debug, Clone)]
pub struct LocalCluster {
    world_size: usize,
    timeout: Option<Duration>,
}

impl LocalCluster {
    pub fn new(world_size: usize) -> Self {
        LocalCluster {
            world_size,
            timeout: None,
        }
    }

    /// Fail receives and collectives that wait longer than `timeout` instead of
    /// blocking forever
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// One connected endpoint per rank, in rank order
    pub fn endpoints(&self) -> Vec<LocalEndpoint> {
        let n = self.world_size;
        let (senders, receivers): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..n).map(|_| mpsc::channel()).unzip();
        let shared = Arc::new(Shared {
            barrier: Mutex::new(BarrierState {
                arrived: vec![false; n],
                count: 0,
                generation: 0,
            }),
            released: Condvar::new(),
            reduce_slots: Mutex::new(vec![f64::NEG_INFINITY; n]),
        });

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalEndpoint {
                rank,
                world_size: n,
                peers: senders.clone(),
                inbox,
                stash: RefCell::new(VecDeque::new()),
                shared: Arc::clone(&shared),
                timeout: self.timeout,
                stats: Cell::new(TransferStats::default()),
            })
            .collect()
    }

    /// Run `job` on every rank in its own thread and collect the results in
    /// rank order. The first error (lowest rank) is returned if any rank fails.
    pub fn run<T, F>(&self, job: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalEndpoint) -> Result<T> + Sync,
    {
        let endpoints = self.endpoints();
        let job = &job;
        thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    let rank = endpoint.rank;
                    (rank, scope.spawn(move || job(endpoint)))
                })
                .collect();

            let mut results = Vec::with_capacity(handles.len());
            let mut first_error = None;
            for (rank, handle) in handles {
                match handle.join() {
                    Ok(Ok(value)) => results.push(value),
                    Ok(Err(err)) => {
                        first_error.get_or_insert(err);
                    }
                    Err(_) => {
                        first_error.get_or_insert(TransposeError::comm(rank, "rank thread panicked"));
                    }
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(results),
            }
        })
    }
}

/// Communication context of one rank of a [`LocalCluster`]
pub struct LocalEndpoint {
    rank: usize,
    world_size: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: RefCell<VecDeque<Envelope>>,
    shared: Arc<Shared>,
    timeout: Option<Duration>,
    stats: Cell<TransferStats>,
}

impl LocalEndpoint {
    fn deliver(&self, dest: usize, tag: u32, payload: &[f32]) -> Result<()> {
        let peer = self.peers.get(dest).ok_or_else(|| {
            TransposeError::comm(
                self.rank,
                format!("destination rank {} outside world of {}", dest, self.world_size),
            )
        })?;
        peer.send(Envelope {
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        })
        .map_err(|_| TransposeError::comm(self.rank, format!("rank {} is no longer reachable", dest)))?;

        let mut stats = self.stats.get();
        stats.messages_sent += 1;
        stats.values_sent += payload.len() as u64;
        self.stats.set(stats);
        Ok(())
    }

    fn accept(&self, envelope: Envelope) -> Vec<f32> {
        let mut stats = self.stats.get();
        stats.messages_received += 1;
        stats.values_received += envelope.payload.len() as u64;
        self.stats.set(stats);
        envelope.payload
    }

    /// Next message from the channel; `waiting_for` only names the peer in errors
    fn next_envelope(&self, waiting_for: usize) -> Result<Envelope> {
        match self.timeout {
            Some(timeout) => self.inbox.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => TransposeError::CommunicationTimeout {
                    rank: self.rank,
                    peer: waiting_for,
                    waited: timeout,
                },
                RecvTimeoutError::Disconnected => {
                    TransposeError::comm(self.rank, "all senders disconnected")
                }
            }),
            None => self
                .inbox
                .recv()
                .map_err(|_| TransposeError::comm(self.rank, "all senders disconnected")),
        }
    }

    fn take_stashed(&self, matches: impl Fn(&Envelope) -> bool) -> Option<Envelope> {
        let mut stash = self.stash.borrow_mut();
        let position = stash.iter().position(matches)?;
        stash.remove(position)
    }

    /// Block until every rank arrives. With a timeout set, a rank that never
    /// arrives turns into `CommunicationTimeout` naming the lowest missing rank.
    fn wait_for_all(&self) -> Result<()> {
        let poisoned = |_| TransposeError::comm(self.rank, "barrier state poisoned");
        let mut state = self.shared.barrier.lock().map_err(poisoned)?;
        let generation = state.generation;
        state.arrived[self.rank] = true;
        state.count += 1;
        if state.count == self.world_size {
            state.arrived.iter_mut().for_each(|a| *a = false);
            state.count = 0;
            state.generation = state.generation.wrapping_add(1);
            self.shared.released.notify_all();
            return Ok(());
        }

        let deadline = self
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout).map(|at| (at, timeout)));
        while state.generation == generation {
            state = match deadline {
                None => self.shared.released.wait(state).map_err(poisoned)?,
                Some((deadline, waited)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let peer = state
                            .arrived
                            .iter()
                            .position(|&a| !a)
                            .unwrap_or(self.rank);
                        state.arrived[self.rank] = false;
                        state.count -= 1;
                        return Err(TransposeError::CommunicationTimeout {
                            rank: self.rank,
                            peer,
                            waited,
                        });
                    }
                    let (state, _) = self
                        .shared
                        .released
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| TransposeError::comm(self.rank, "barrier state poisoned"))?;
                    state
                }
            };
        }
        Ok(())
    }

    fn check_source(&self, source: usize) -> Result<()> {
        if source >= self.world_size {
            return Err(TransposeError::comm(
                self.rank,
                format!("source rank {} outside world of {}", source, self.world_size),
            ));
        }
        Ok(())
    }
}

impl Communicator for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, dest: usize, tag: u32, payload: &[f32]) -> Result<()> {
        self.deliver(dest, tag, payload)
    }

    fn recv(&self, source: usize, tag: u32) -> Result<Vec<f32>> {
        self.check_source(source)?;
        if let Some(envelope) = self.take_stashed(|e| e.source == source && e.tag == tag) {
            return Ok(self.accept(envelope));
        }
        loop {
            let envelope = self.next_envelope(source)?;
            if envelope.source == source && envelope.tag == tag {
                return Ok(self.accept(envelope));
            }
            self.stash.borrow_mut().push_back(envelope);
        }
    }

    fn isend(&self, dest: usize, tag: u32, payload: &[f32]) -> Result<Request> {
        self.deliver(dest, tag, payload)?;
        Ok(Request::Send { dest, tag })
    }

    fn wait_any(&self, requests: &mut RequestSet) -> Result<Option<Completion>> {
        if requests.is_empty() {
            return Ok(None);
        }
        // sends are buffered and therefore already complete
        if let Some(position) = requests.first_send() {
            if let Request::Send { dest, .. } = requests.take(position) {
                return Ok(Some(Completion::Sent { dest }));
            }
        }

        if let Some(envelope) = self.take_stashed(|e| requests.find_recv(e.source, e.tag).is_some()) {
            if let Some(position) = requests.find_recv(envelope.source, envelope.tag) {
                requests.take(position);
            }
            let source = envelope.source;
            return Ok(Some(Completion::Received {
                source,
                payload: self.accept(envelope),
            }));
        }

        let waiting_for = match requests.requests().first() {
            Some(Request::Recv { source, .. }) => *source,
            _ => self.rank,
        };
        loop {
            let envelope = self.next_envelope(waiting_for)?;
            if let Some(position) = requests.find_recv(envelope.source, envelope.tag) {
                requests.take(position);
                let source = envelope.source;
                return Ok(Some(Completion::Received {
                    source,
                    payload: self.accept(envelope),
                }));
            }
            debug!(
                "rank {}: parking message from rank {} (tag {})",
                self.rank, envelope.source, envelope.tag
            );
            self.stash.borrow_mut().push_back(envelope);
        }
    }

    fn barrier(&self) -> Result<()> {
        self.wait_for_all()
    }

    fn all_reduce_max(&self, value: f64) -> Result<f64> {
        let poisoned = |_| TransposeError::comm(self.rank, "reduction state poisoned");
        {
            let mut slots = self.shared.reduce_slots.lock().map_err(poisoned)?;
            slots[self.rank] = value;
        }
        self.wait_for_all()?;
        let max = {
            let slots = self.shared.reduce_slots.lock().map_err(poisoned)?;
            slots.iter().copied().fold(f64::NEG_INFINITY, |acc, v| {
                if acc.is_nan() || v.is_nan() {
                    f64::NAN
                } else {
                    acc.max(v)
                }
            })
        };
        // nobody may overwrite a slot before every rank has read the result
        self.wait_for_all()?;
        Ok(max)
    }

    fn stats(&self) -> TransferStats {
        self.stats.get()
    }
}
