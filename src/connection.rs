//! Resources of one side of the echo connection.

use std::collections::VecDeque;

use log::info;

use crate::{
    config::DeviceConfig,
    descriptor::ConnectionDescriptor,
    error::{BenchError, Result},
    qp::{QpState, QpStateMachine},
    ring::BufferRing,
    verbs::{QpCaps, VerbsOps},
};

/// Posted operations that have not completed yet.
#[derive(Debug)]
pub(crate) struct InFlight {
    /// Slots of posted receives, oldest first
    pub(crate) recvs: VecDeque<usize>,
    pub(crate) recv_limit: usize,
    pub(crate) sends: usize,
    pub(crate) send_limit: usize,
}

impl InFlight {
    fn new(concurrency: usize, caps: QpCaps) -> Self {
        Self {
            recvs: VecDeque::with_capacity(concurrency),
            recv_limit: concurrency,
            sends: 0,
            send_limit: caps.max_send_wr as usize,
        }
    }

    fn clear(&mut self) {
        self.recvs.clear();
        self.sends = 0;
    }
}

/// Owns the verbs context, the registered buffer ring and the in-flight
/// bookkeeping of one queue pair.
///
/// Resources are released by [`Connection::teardown`] or on drop, whichever
/// happens first.
#[derive(Debug)]
pub struct Connection<V: VerbsOps> {
    pub(crate) verbs: V,
    pub(crate) ring: BufferRing,
    pub(crate) inflight: InFlight,
    fsm: QpStateMachine,
    local: ConnectionDescriptor,
    torn_down: bool,
}

impl<V: VerbsOps> Connection<V> {
    /// Allocates and registers `concurrency` slots of `message_size` bytes.
    pub fn new(mut verbs: V, message_size: usize, concurrency: usize) -> Result<Self> {
        let ring = BufferRing::new(&mut verbs, message_size, concurrency)?;
        let local = ConnectionDescriptor {
            lid: verbs.port_attr().lid,
            qp_num: verbs.qp_num(),
            gid: verbs.gid(),
        };
        Ok(Self {
            verbs,
            ring,
            inflight: InFlight::new(concurrency, QpCaps::for_concurrency(concurrency)),
            fsm: QpStateMachine::new(),
            local,
            torn_down: false,
        })
    }

    pub fn local_descriptor(&self) -> ConnectionDescriptor {
        self.local
    }

    /// Moves the queue pair from RESET to ready-to-send against `remote`.
    pub fn connect(&mut self, remote: &ConnectionDescriptor, cfg: &DeviceConfig) -> Result<()> {
        self.ensure_live()?;
        self.fsm.connect(&mut self.verbs, remote, cfg)
    }

    pub fn state(&self) -> QpState {
        self.fsm.state()
    }

    pub fn verbs(&self) -> &V {
        &self.verbs
    }

    pub fn ring(&self) -> &BufferRing {
        &self.ring
    }

    pub fn concurrency(&self) -> usize {
        self.ring.slots()
    }

    pub fn message_size(&self) -> usize {
        self.ring.message_size()
    }

    pub fn outstanding_recvs(&self) -> usize {
        self.inflight.recvs.len()
    }

    pub fn outstanding_sends(&self) -> usize {
        self.inflight.sends
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(BenchError::Submission("connection already torn down".into()));
        }
        Ok(())
    }

    /// Releases the queue pair, completion queue, memory registration and
    /// device context. Calling it again has no effect.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.inflight.clear();
        self.verbs.release();
        info!("connection to qp {:#x} torn down", self.local.qp_num);
    }
}

impl<V: VerbsOps> Drop for Connection<V> {
    fn drop(&mut self) {
        self.teardown();
    }
}
