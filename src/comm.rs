//! Message passing between ranks.
//!
//! Messages are byte buffers (see [`wire`]) matched on `(source, context,
//! tag)` in the order in which they were sent. Every rank must call the
//! collectives in the same order.

use std::{
    ops::Add,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::{errors::TransportError, macros::fatal};

#[cfg(feature = "mpi")]
mod mpi_comm;
pub mod wire;

#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;
use wire::Wire;

/// Separate tag spaces for the different exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgContext {
    Tasks,
    Cells,
    Strays,
    Redistribute,
    Collective,
}

impl MsgContext {
    pub const COUNT: usize = 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    fn apply<T: Copy + PartialOrd + Add<Output = T>>(self, a: T, b: T) -> T {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min if b < a => b,
            ReduceOp::Max if b > a => b,
            _ => a,
        }
    }
}

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Non-blocking send.
    fn send(&self, dest: usize, context: MsgContext, tag: u64, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Return the oldest matching message if it has arrived.
    fn try_recv(&self, source: usize, context: MsgContext, tag: u64) -> Result<Option<Vec<u8>>, TransportError>;

    /// Block until a matching message arrives.
    fn recv(&self, source: usize, context: MsgContext, tag: u64) -> Result<Vec<u8>, TransportError>;

    /// Element-wise reduction of `values` over all ranks, in place.
    fn all_reduce_u64(&self, values: &mut [u64], op: ReduceOp) -> Result<(), TransportError>;

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), TransportError>;

    /// One value per rank, in rank order.
    fn all_gather_f64(&self, value: f64) -> Result<Vec<f64>, TransportError>;

    /// The bytes given by `root`, on every rank.
    fn broadcast_bytes(&self, root: usize, bytes: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

fn decode_message<T: Wire>(bytes: &[u8], source: usize, tag: u64) -> Result<T, TransportError> {
    wire::decode(bytes).ok_or(TransportError::Malformed { source_rank: source, tag })
}

/// Typed helpers and collectives on top of [`Communicator`]. Transport
/// failures are fatal.
pub trait CommExt: Communicator {
    fn send_vec<T: Wire>(&self, dest: usize, context: MsgContext, tag: u64, data: Vec<T>) {
        if let Err(e) = self.send(dest, context, tag, wire::encode(&data)) {
            fatal!("Failed to send message to rank {} (tag {}): {}", dest, tag, e);
        }
    }

    fn recv_vec<T: Wire>(&self, source: usize, context: MsgContext, tag: u64) -> Vec<T> {
        match self.recv(source, context, tag).and_then(|b| decode_message(&b, source, tag)) {
            Ok(data) => data,
            Err(e) => fatal!("Failed to receive message from rank {} (tag {}): {}", source, tag, e),
        }
    }

    fn try_recv_vec<T: Wire>(&self, source: usize, context: MsgContext, tag: u64) -> Option<Vec<T>> {
        let received = self
            .try_recv(source, context, tag)
            .and_then(|b| b.map(|b| decode_message(&b, source, tag)).transpose());
        match received {
            Ok(data) => data,
            Err(e) => fatal!("Failed to test for message from rank {} (tag {}): {}", source, tag, e),
        }
    }

    fn all_reduce_sum(&self, mut values: Vec<u64>) -> Vec<u64> {
        if let Err(e) = self.all_reduce_u64(&mut values, ReduceOp::Sum) {
            fatal!("All-reduce failed: {}", e);
        }
        values
    }

    fn all_reduce_sum_f64(&self, mut values: Vec<f64>) -> Vec<f64> {
        if let Err(e) = self.all_reduce_f64(&mut values, ReduceOp::Sum) {
            fatal!("All-reduce failed: {}", e);
        }
        values
    }

    fn all_reduce_min(&self, value: u64) -> u64 {
        let mut values = [value];
        if let Err(e) = self.all_reduce_u64(&mut values, ReduceOp::Min) {
            fatal!("All-reduce failed: {}", e);
        }
        values[0]
    }

    fn all_reduce_max(&self, value: u64) -> u64 {
        let mut values = [value];
        if let Err(e) = self.all_reduce_u64(&mut values, ReduceOp::Max) {
            fatal!("All-reduce failed: {}", e);
        }
        values[0]
    }

    fn all_reduce_or(&self, value: bool) -> bool {
        self.all_reduce_max(u64::from(value)) > 0
    }

    /// Send `value` from `root` to every rank.
    fn broadcast<T: Wire>(&self, root: usize, value: T) -> T {
        let bytes = if self.rank() == root { wire::encode(&value) } else { vec![] };
        match self.broadcast_bytes(root, bytes).and_then(|b| decode_message(&b, root, 0)) {
            Ok(value) => value,
            Err(e) => fatal!("Broadcast from rank {} failed: {}", root, e),
        }
    }

    /// Collect one value per rank on every rank, in rank order.
    fn all_gather(&self, value: f64) -> Vec<f64> {
        match self.all_gather_f64(value) {
            Ok(values) => values,
            Err(e) => fatal!("All-gather failed: {}", e),
        }
    }

    fn barrier(&self) {
        self.all_reduce_max(0);
    }
}

impl<C: Communicator + ?Sized> CommExt for C {}

struct Envelope {
    source: usize,
    context: MsgContext,
    tag: u64,
    bytes: Vec<u8>,
}

/// Ranks running as threads of one process, connected by channels.
///
/// Collectives go through rank 0 as point-to-point messages in the
/// [`MsgContext::Collective`] context, tagged with a per-rank sequence
/// number.
pub struct LocalComm {
    rank: usize,
    senders: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    pending: Mutex<Vec<Envelope>>,
    collective_seq: AtomicU64,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.senders.len())
            .finish()
    }
}

impl LocalComm {
    /// Create the communicators of a world of `size` ranks.
    pub fn world(size: usize) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| LocalComm {
                rank,
                senders: senders.clone(),
                receiver,
                pending: Mutex::new(vec![]),
                collective_seq: AtomicU64::new(0),
            })
            .collect()
    }

    fn take_pending(&self, source: usize, context: MsgContext, tag: u64) -> Option<Vec<u8>> {
        let mut pending = self.pending.lock();
        pending.extend(self.receiver.try_iter());
        let position = pending
            .iter()
            .position(|e| e.source == source && e.context == context && e.tag == tag)?;
        Some(pending.remove(position).bytes)
    }

    fn next_collective(&self) -> u64 {
        self.collective_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn reduce<T>(&self, values: &mut [T], op: ReduceOp) -> Result<(), TransportError>
    where
        T: Wire + Copy + PartialOrd + Add<Output = T>,
    {
        let seq = self.next_collective();
        let context = MsgContext::Collective;
        if self.size() == 1 {
            return Ok(());
        }
        let result: Vec<T> = if self.rank == 0 {
            let mut acc = values.to_vec();
            for source in 1..self.size() {
                let other: Vec<T> = decode_message(&self.recv(source, context, seq)?, source, seq)?;
                if other.len() != acc.len() {
                    return Err(TransportError::Malformed { source_rank: source, tag: seq });
                }
                for (a, b) in acc.iter_mut().zip(other) {
                    *a = op.apply(*a, b);
                }
            }
            let bytes = wire::encode(&acc);
            for dest in 1..self.size() {
                self.send(dest, context, seq, bytes.clone())?;
            }
            acc
        } else {
            self.send(0, context, seq, wire::encode(&values.to_vec()))?;
            decode_message(&self.recv(0, context, seq)?, 0, seq)?
        };
        if result.len() != values.len() {
            return Err(TransportError::Malformed { source_rank: 0, tag: seq });
        }
        values.copy_from_slice(&result);
        Ok(())
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, dest: usize, context: MsgContext, tag: u64, bytes: Vec<u8>) -> Result<(), TransportError> {
        let sender = self.senders.get(dest).ok_or(TransportError::InvalidRank(dest))?;
        sender
            .send(Envelope {
                source: self.rank,
                context,
                tag,
                bytes,
            })
            .map_err(|_| TransportError::Disconnected(dest))
    }

    fn try_recv(&self, source: usize, context: MsgContext, tag: u64) -> Result<Option<Vec<u8>>, TransportError> {
        if source >= self.size() {
            return Err(TransportError::InvalidRank(source));
        }
        Ok(self.take_pending(source, context, tag))
    }

    fn recv(&self, source: usize, context: MsgContext, tag: u64) -> Result<Vec<u8>, TransportError> {
        if source >= self.size() {
            return Err(TransportError::InvalidRank(source));
        }
        loop {
            if let Some(bytes) = self.take_pending(source, context, tag) {
                return Ok(bytes);
            }
            match self.receiver.recv_timeout(Duration::from_millis(10)) {
                Ok(envelope) => self.pending.lock().push(envelope),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected(source)),
            }
        }
    }

    fn all_reduce_u64(&self, values: &mut [u64], op: ReduceOp) -> Result<(), TransportError> {
        self.reduce(values, op)
    }

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), TransportError> {
        self.reduce(values, op)
    }

    fn all_gather_f64(&self, value: f64) -> Result<Vec<f64>, TransportError> {
        let seq = self.next_collective();
        let context = MsgContext::Collective;
        for dest in (0..self.size()).filter(|&d| d != self.rank) {
            self.send(dest, context, seq, wire::encode(&value))?;
        }
        (0..self.size())
            .map(|source| {
                if source == self.rank {
                    Ok(value)
                } else {
                    decode_message(&self.recv(source, context, seq)?, source, seq)
                }
            })
            .collect()
    }

    fn broadcast_bytes(&self, root: usize, bytes: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let seq = self.next_collective();
        let context = MsgContext::Collective;
        if self.rank != root {
            return self.recv(root, context, seq);
        }
        for dest in (0..self.size()).filter(|&d| d != root) {
            self.send(dest, context, seq, bytes.clone())?;
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run_world<T: Send>(size: usize, f: impl Fn(LocalComm) -> T + Sync) -> Vec<T> {
        let world = LocalComm::world(size);
        std::thread::scope(|s| {
            let handles: Vec<_> = world.into_iter().map(|comm| s.spawn(|| f(comm))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_matching_on_tag() {
        let results = run_world(2, |comm| {
            if comm.rank() == 0 {
                comm.send_vec(1, MsgContext::Tasks, 7, vec![7u32]);
                comm.send_vec(1, MsgContext::Tasks, 3, vec![3u32]);
                vec![]
            } else {
                let three: Vec<u32> = comm.recv_vec(0, MsgContext::Tasks, 3);
                let seven: Vec<u32> = comm.recv_vec(0, MsgContext::Tasks, 7);
                assert!(comm.try_recv_vec::<u32>(0, MsgContext::Tasks, 3).is_none());
                [three, seven].concat()
            }
        });
        assert_eq!(results[1], vec![3, 7]);
    }

    #[test]
    fn test_collectives() {
        let results = run_world(3, |comm| {
            let sum = comm.all_reduce_sum(vec![comm.rank() as u64, 1]);
            let min = comm.all_reduce_min(10 + comm.rank() as u64);
            let root = comm.broadcast(2, comm.rank() * 100);
            let gathered = comm.all_gather(comm.rank() as f64);
            comm.barrier();
            (sum, min, root, gathered)
        });
        for (sum, min, root, gathered) in results {
            assert_eq!(sum, vec![3, 3]);
            assert_eq!(min, 10);
            assert_eq!(root, 200);
            assert_eq!(gathered, vec![0., 1., 2.]);
        }
    }

    #[test]
    fn test_invalid_rank() {
        let world = LocalComm::world(1);
        assert!(matches!(
            world[0].send(3, MsgContext::Tasks, 0, vec![]),
            Err(TransportError::InvalidRank(3))
        ));
    }
}
