//! Transport over MPI, one process per rank.
//!
//! Every message context gets its own duplicate of the world communicator,
//! so tags of different exchanges never match each other. Sends are
//! non-blocking: the buffer of a send is kept alive until its request
//! completes.

use std::thread;

use mpi::{
    collective::SystemOperation,
    environment::Universe,
    request::{Request, StaticScope},
    topology::{Communicator as MpiCommunicator, SimpleCommunicator},
    traits::*,
    Threading,
};
use parking_lot::Mutex;

use super::{Communicator, MsgContext, ReduceOp};
use crate::errors::TransportError;

/// A send in flight and the buffer it reads from.
struct InFlight {
    request: Request<'static, [u8], StaticScope>,
    buffer: *mut [u8],
}

struct State {
    world: SimpleCommunicator,
    contexts: Vec<SimpleCommunicator>,
    in_flight: Vec<InFlight>,
}

impl State {
    /// Release the buffers of the sends that completed.
    fn reap(&mut self) {
        let mut running = Vec::with_capacity(self.in_flight.len());
        for send in self.in_flight.drain(..) {
            match send.request.test() {
                // SAFETY: the request completed, nothing reads the buffer any more.
                Ok(_) => drop(unsafe { Box::from_raw(send.buffer) }),
                Err(request) => running.push(InFlight {
                    request,
                    buffer: send.buffer,
                }),
            }
        }
        self.in_flight = running;
    }

    fn context(&self, context: MsgContext) -> &SimpleCommunicator {
        &self.contexts[context as usize]
    }
}

pub struct MpiComm {
    rank: usize,
    size: usize,
    state: Mutex<State>,
    /// Finalizes MPI on drop, after the communicators in `state`.
    _universe: Universe,
}

// SAFETY: MPI runs with at least MPI_THREAD_SERIALIZED and every call goes
// through the `state` mutex, so no two threads are ever inside MPI at once.
unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl std::fmt::Debug for MpiComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpiComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl MpiComm {
    /// Initialise MPI and wrap its world communicator. Can only be called
    /// once per process.
    pub fn init() -> Result<Self, TransportError> {
        let (universe, threading) =
            mpi::initialize_with_threading(Threading::Multiple).ok_or(TransportError::MpiInit)?;
        if matches!(threading, Threading::Single | Threading::Funneled) {
            return Err(TransportError::ThreadingLevel(format!("{:?}", threading)));
        }
        let world = universe.world();
        let contexts = (0..MsgContext::COUNT).map(|_| world.duplicate()).collect();
        tracing::debug!("MPI rank {} of {} with {:?} thread support.", world.rank(), world.size(), threading);
        Ok(Self {
            rank: world.rank() as usize,
            size: world.size() as usize,
            state: Mutex::new(State {
                world,
                contexts,
                in_flight: vec![],
            }),
            _universe: universe,
        })
    }

    fn check_rank(&self, rank: usize) -> Result<i32, TransportError> {
        if rank >= self.size {
            return Err(TransportError::InvalidRank(rank));
        }
        Ok(rank as i32)
    }
}

fn mpi_tag(tag: u64) -> Result<i32, TransportError> {
    i32::try_from(tag).map_err(|_| TransportError::TagOverflow(tag))
}

fn system_op(op: ReduceOp) -> SystemOperation {
    match op {
        ReduceOp::Sum => SystemOperation::sum(),
        ReduceOp::Min => SystemOperation::min(),
        ReduceOp::Max => SystemOperation::max(),
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, context: MsgContext, tag: u64, bytes: Vec<u8>) -> Result<(), TransportError> {
        let dest = self.check_rank(dest)?;
        let tag = mpi_tag(tag)?;
        let buffer = Box::into_raw(bytes.into_boxed_slice());
        // SAFETY: the buffer is only freed by `reap` or `drop`, once the
        // request reading it completed.
        let data: &'static [u8] = unsafe { &*buffer };
        let mut state = self.state.lock();
        state.reap();
        let request = state
            .context(context)
            .process_at_rank(dest)
            .immediate_send_with_tag(StaticScope, data, tag);
        state.in_flight.push(InFlight { request, buffer });
        Ok(())
    }

    fn try_recv(&self, source: usize, context: MsgContext, tag: u64) -> Result<Option<Vec<u8>>, TransportError> {
        let source = self.check_rank(source)?;
        let tag = mpi_tag(tag)?;
        let mut state = self.state.lock();
        state.reap();
        let matched = state
            .context(context)
            .process_at_rank(source)
            .immediate_matched_probe_with_tag(tag);
        Ok(matched.map(|(message, _)| message.matched_receive_vec::<u8>().0))
    }

    fn recv(&self, source: usize, context: MsgContext, tag: u64) -> Result<Vec<u8>, TransportError> {
        // Polling keeps the lock free for the sends of other threads.
        loop {
            if let Some(bytes) = self.try_recv(source, context, tag)? {
                return Ok(bytes);
            }
            thread::yield_now();
        }
    }

    fn all_reduce_u64(&self, values: &mut [u64], op: ReduceOp) -> Result<(), TransportError> {
        let input = values.to_vec();
        let state = self.state.lock();
        state.world.all_reduce_into(&input[..], values, system_op(op));
        Ok(())
    }

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> Result<(), TransportError> {
        let input = values.to_vec();
        let state = self.state.lock();
        state.world.all_reduce_into(&input[..], values, system_op(op));
        Ok(())
    }

    fn all_gather_f64(&self, value: f64) -> Result<Vec<f64>, TransportError> {
        let mut values = vec![0f64; self.size];
        let state = self.state.lock();
        state.world.all_gather_into(&value, &mut values[..]);
        Ok(values)
    }

    fn broadcast_bytes(&self, root: usize, bytes: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let root_rank = self.check_rank(root)?;
        let state = self.state.lock();
        let root_process = state.world.process_at_rank(root_rank);
        let mut len = bytes.len() as u64;
        root_process.broadcast_into(&mut len);
        let mut buffer = if self.rank == root { bytes } else { vec![0u8; len as usize] };
        root_process.broadcast_into(&mut buffer[..]);
        Ok(buffer)
    }
}

impl Drop for MpiComm {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for send in state.in_flight.drain(..) {
            send.request.wait();
            // SAFETY: the request completed, nothing reads the buffer any more.
            drop(unsafe { Box::from_raw(send.buffer) });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::CommExt;

    /// Runs as a singleton MPI process when not started by `mpirun`.
    #[test]
    fn test_single_process() {
        let comm = MpiComm::init().unwrap();
        assert_eq!(comm.size(), 1);
        comm.send_vec(0, MsgContext::Tasks, 5, vec![1.5f64, 2.5]);
        comm.send_vec(0, MsgContext::Cells, 5, vec![7u64]);
        let cells: Vec<u64> = comm.recv_vec(0, MsgContext::Cells, 5);
        let tasks: Vec<f64> = comm.recv_vec(0, MsgContext::Tasks, 5);
        assert_eq!((cells, tasks), (vec![7], vec![1.5, 2.5]));
        assert_eq!(comm.all_reduce_sum(vec![3, 4]), vec![3, 4]);
        assert!(comm.broadcast(0, true));
        assert_eq!(comm.all_gather(0.25), vec![0.25]);
    }
}
