//! In-process verbs provider: two connected endpoints exchanging messages
//! over channels, with the local memory semantics of a real device.

use std::{
    collections::VecDeque,
    ptr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::random;

use super::{
    AccessFlags, LinkLayer, MrKeys, Mtu, PortAttr, QpCaps, RecvWr, SendWr, Sge, VerbsOps,
    WcOpcode, WcStatus, WorkCompletion,
};
use crate::{
    descriptor::Gid,
    error::{BenchError, Result},
    qp::{AddressMode, QpAttr, QpState},
};

const WC_LOC_LEN_ERR: WcStatus = WcStatus::Failed {
    code: 1,
    reason: "local length error",
};
const WC_LOC_PROT_ERR: WcStatus = WcStatus::Failed {
    code: 4,
    reason: "local protection error",
};
const WC_WR_FLUSH_ERR: WcStatus = WcStatus::Failed {
    code: 5,
    reason: "work request flushed",
};
const WC_RETRY_EXC_ERR: WcStatus = WcStatus::Failed {
    code: 12,
    reason: "transport retry counter exceeded",
};

/// Time before a send to a vanished peer reports retry exhaustion
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Message on the emulated wire.
#[derive(Debug)]
struct Packet {
    payload: Vec<u8>,
    imm_data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpSide {
    Send,
    Recv,
}

/// Counters observed by tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockStats {
    pub transitions: usize,
    pub posted_sends: usize,
    pub posted_recvs: usize,
    pub completions: usize,
    pub releases: usize,
}

#[derive(Debug, Default)]
struct Shared {
    stats: MockStats,
    fail_at: Option<(usize, WcStatus)>,
}

/// Handle shared with a [`MockVerbs`] endpoint, usable after the endpoint
/// has moved into a connection or a worker thread.
#[derive(Debug, Clone, Default)]
pub struct MockController {
    inner: Arc<Mutex<Shared>>,
}

impl MockController {
    pub fn stats(&self) -> MockStats {
        self.inner.lock().stats
    }

    /// The completion delivered after `completions` others reports `status`.
    pub fn inject_failure(&self, completions: usize, status: WcStatus) {
        self.inner.lock().fail_at = Some((completions, status));
    }

    fn deliver(&self, mut wc: WorkCompletion) -> WorkCompletion {
        let mut shared = self.inner.lock();
        if let Some((at, status)) = shared.fail_at {
            if shared.stats.completions == at {
                shared.fail_at = None;
                wc.status = status;
                wc.opcode = None;
                wc.imm_data = None;
            }
        }
        shared.stats.completions += 1;
        wc
    }

    fn record(&self, f: impl FnOnce(&mut MockStats)) {
        f(&mut self.inner.lock().stats);
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    addr: u64,
    len: u64,
    keys: MrKeys,
}

/// One endpoint of an emulated reliable connection.
#[derive(Debug)]
pub struct MockVerbs {
    name: String,
    qpn: u32,
    port: PortAttr,
    gid: Gid,
    peer: PortAttr,
    peer_qpn: u32,
    peer_gid: Gid,
    caps: QpCaps,
    state: QpState,
    regions: Vec<Region>,
    tx: Option<flume::Sender<Packet>>,
    rx: flume::Receiver<Packet>,
    recv_queue: VecDeque<RecvWr>,
    /// Arrived before a receive was posted, held as if RNR-retried
    backlog: VecDeque<Packet>,
    completions: VecDeque<(WorkCompletion, OpSide)>,
    /// Failed sends waiting out the retry timer
    retrying: VecDeque<(Instant, WorkCompletion)>,
    outstanding_sends: usize,
    control: MockController,
    released: bool,
}

fn gen_qpn() -> u32 {
    (random::<u32>() & 0x00ff_ffff).max(1)
}

fn link_local_gid(qpn: u32) -> Gid {
    let mut raw = [0u8; 16];
    raw[0] = 0xfe;
    raw[1] = 0x80;
    raw[12..].copy_from_slice(&qpn.to_be_bytes());
    Gid(raw)
}

impl MockVerbs {
    /// Creates two endpoints on an InfiniBand link.
    pub fn pair(caps: QpCaps) -> (Self, Self) {
        Self::pair_with(caps, LinkLayer::InfiniBand)
    }

    /// Creates two endpoints on a link of the given type.
    pub fn pair_with(caps: QpCaps, link_layer: LinkLayer) -> (Self, Self) {
        let (tx_a, rx_b) = flume::unbounded();
        let (tx_b, rx_a) = flume::unbounded();
        let qpn_a = gen_qpn();
        let qpn_b = qpn_a.wrapping_add(1) & 0x00ff_ffff;
        let global = link_layer == LinkLayer::Ethernet;
        let port_for = |lid: u16| PortAttr {
            lid: if global { 0 } else { lid },
            link_layer,
            active_mtu: Mtu::Mtu1024,
        };
        let gid_for = |qpn: u32| if global { link_local_gid(qpn) } else { Gid::default() };
        let mut a = Self::new("mock0", qpn_a, port_for(1), gid_for(qpn_a), caps, tx_a, rx_a);
        let mut b = Self::new("mock1", qpn_b, port_for(2), gid_for(qpn_b), caps, tx_b, rx_b);
        a.bind_peer(&b);
        b.bind_peer(&a);
        (a, b)
    }

    fn new(
        name: &str,
        qpn: u32,
        port: PortAttr,
        gid: Gid,
        caps: QpCaps,
        tx: flume::Sender<Packet>,
        rx: flume::Receiver<Packet>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            qpn,
            port,
            gid,
            peer: PortAttr::default(),
            peer_qpn: 0,
            peer_gid: Gid::default(),
            caps,
            state: QpState::Reset,
            regions: Vec::new(),
            tx: Some(tx),
            rx,
            recv_queue: VecDeque::new(),
            backlog: VecDeque::new(),
            completions: VecDeque::new(),
            retrying: VecDeque::new(),
            outstanding_sends: 0,
            control: MockController::default(),
            released: false,
        }
    }

    fn bind_peer(&mut self, peer: &Self) {
        self.peer = peer.port;
        self.peer_qpn = peer.qpn;
        self.peer_gid = peer.gid;
    }

    pub fn controller(&self) -> MockController {
        self.control.clone()
    }

    pub fn stats(&self) -> MockStats {
        self.control.stats()
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    fn check_sge(&self, sge: &Sge) -> bool {
        let end = sge.addr.saturating_add(u64::from(sge.length));
        self.regions
            .iter()
            .any(|r| r.keys.lkey == sge.lkey && sge.addr >= r.addr && end <= r.addr + r.len)
    }

    fn check_rtr(&self, dest_qp_num: u32, address: &AddressMode) -> Result<()> {
        if dest_qp_num != self.peer_qpn {
            return Err(BenchError::Setup(format!(
                "destination qp {dest_qp_num:#x} unreachable"
            )));
        }
        let reachable = match (*address, self.port.link_layer) {
            (AddressMode::Global { dgid, .. }, LinkLayer::Ethernet) => dgid == self.peer_gid,
            (AddressMode::Local { dlid }, LinkLayer::InfiniBand | LinkLayer::Unspecified) => {
                dlid == self.peer.lid
            }
            _ => false,
        };
        if !reachable {
            return Err(BenchError::Setup(format!(
                "address {address:?} does not route to the peer"
            )));
        }
        Ok(())
    }

    /// Matches arrived packets against posted receives in order.
    fn deliver_inbound(&mut self) {
        self.backlog.extend(self.rx.try_iter());
        while !self.backlog.is_empty() && !self.recv_queue.is_empty() {
            let (Some(packet), Some(wr)) = (self.backlog.pop_front(), self.recv_queue.pop_front())
            else {
                break;
            };
            let len = packet.payload.len();
            let status = if len > wr.sge.length as usize {
                WC_LOC_LEN_ERR
            } else {
                // SAFETY: the range was checked against a registered region at post time
                unsafe {
                    ptr::copy_nonoverlapping(packet.payload.as_ptr(), wr.sge.addr as *mut u8, len);
                }
                WcStatus::Success
            };
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: Some(WcOpcode::Recv),
                byte_len: u32::try_from(len).unwrap_or(u32::MAX),
                imm_data: Some(packet.imm_data),
            };
            self.completions.push_back((wc, OpSide::Recv));
        }
        if self.rx.is_disconnected() && self.rx.is_empty() && self.backlog.is_empty() {
            self.flush_receives();
        }
    }

    /// The peer is gone and its wire is drained: the queue pair moves to the
    /// error state and every posted receive completes as flushed.
    fn flush_receives(&mut self) {
        if self.recv_queue.is_empty() {
            return;
        }
        warn!(
            "{}: peer disconnected, flushing {} receives",
            self.name,
            self.recv_queue.len()
        );
        for wr in self.recv_queue.drain(..) {
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status: WC_WR_FLUSH_ERR,
                ..WorkCompletion::default()
            };
            self.completions.push_back((wc, OpSide::Recv));
        }
    }
}

impl VerbsOps for MockVerbs {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn port_attr(&self) -> PortAttr {
        self.port
    }

    fn gid(&self) -> Gid {
        self.gid
    }

    fn qp_num(&self) -> u32 {
        self.qpn
    }

    fn reg_mr(&mut self, addr: u64, length: usize, access: AccessFlags) -> Result<MrKeys> {
        if self.released {
            return Err(BenchError::Setup("device released".into()));
        }
        if addr == 0 || length == 0 {
            return Err(BenchError::InvalidInput(format!(
                "cannot register {length} bytes at {addr:#x}"
            )));
        }
        let key = u32::try_from(self.regions.len() + 1).unwrap_or(u32::MAX) << 8 | 0x5a;
        let keys = MrKeys {
            lkey: key,
            rkey: key,
        };
        self.regions.push(Region {
            addr,
            len: length as u64,
            keys,
        });
        debug!(
            "{}: registered {length} bytes at {addr:#x} access {:#x}",
            self.name, access.0
        );
        Ok(keys)
    }

    fn modify_qp(&mut self, attr: &QpAttr) -> Result<()> {
        let target = attr.target();
        if self.state.successor() != Some(target) {
            return Err(BenchError::Setup(format!(
                "invalid qp state transition {:?} -> {target:?}",
                self.state
            )));
        }
        if let QpAttr::Rtr {
            dest_qp_num,
            ref address,
            ..
        } = *attr
        {
            self.check_rtr(dest_qp_num, address)?;
        }
        self.state = target;
        self.control.record(|s| s.transitions += 1);
        Ok(())
    }

    fn post_send(&mut self, wr: &SendWr) -> Result<()> {
        if self.state != QpState::ReadyToSend {
            return Err(BenchError::Submission(format!(
                "send posted in state {:?}",
                self.state
            )));
        }
        if self.outstanding_sends >= self.caps.max_send_wr as usize {
            return Err(BenchError::Submission("send queue full".into()));
        }
        self.outstanding_sends += 1;
        self.control.record(|s| s.posted_sends += 1);
        if !self.check_sge(&wr.sge) {
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status: WC_LOC_PROT_ERR,
                ..WorkCompletion::default()
            };
            self.completions.push_back((wc, OpSide::Send));
            return Ok(());
        }
        let mut payload = vec![0u8; wr.sge.length as usize];
        // SAFETY: the range lies within a registered region
        unsafe {
            ptr::copy_nonoverlapping(wr.sge.addr as *const u8, payload.as_mut_ptr(), payload.len());
        }
        let delivered = self.tx.as_ref().is_some_and(|tx| {
            tx.send(Packet {
                payload,
                imm_data: wr.imm_data,
            })
            .is_ok()
        });
        let mut wc = WorkCompletion {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            opcode: Some(WcOpcode::Send),
            byte_len: wr.sge.length,
            imm_data: None,
        };
        if delivered {
            self.completions.push_back((wc, OpSide::Send));
        } else {
            warn!("{}: peer unreachable, send {:#x} retrying", self.name, wr.wr_id);
            wc.status = WC_RETRY_EXC_ERR;
            self.retrying.push_back((Instant::now() + RETRY_DELAY, wc));
        }
        Ok(())
    }

    fn post_recv(&mut self, wr: &RecvWr) -> Result<()> {
        if self.state == QpState::Reset {
            return Err(BenchError::Submission("receive posted in RESET".into()));
        }
        if self.recv_queue.len() >= self.caps.max_recv_wr as usize {
            return Err(BenchError::Submission("receive queue full".into()));
        }
        if !self.check_sge(&wr.sge) {
            return Err(BenchError::Submission(format!(
                "receive buffer {:#x}+{} not registered",
                wr.sge.addr, wr.sge.length
            )));
        }
        self.recv_queue.push_back(*wr);
        self.control.record(|s| s.posted_recvs += 1);
        Ok(())
    }

    fn poll_cq(&mut self, wc: &mut [WorkCompletion]) -> Result<usize> {
        let now = Instant::now();
        while let Some(&(deadline, failed)) = self.retrying.front() {
            if deadline > now {
                break;
            }
            self.retrying.pop_front();
            self.completions.push_back((failed, OpSide::Send));
        }
        if self.state == QpState::ReadyToReceive || self.state == QpState::ReadyToSend {
            self.deliver_inbound();
        }
        let mut n = 0;
        for slot in wc.iter_mut() {
            let Some((next, side)) = self.completions.pop_front() else {
                break;
            };
            if side == OpSide::Send {
                self.outstanding_sends = self.outstanding_sends.saturating_sub(1);
            }
            *slot = self.control.deliver(next);
            n += 1;
        }
        Ok(n)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tx = None;
        self.recv_queue.clear();
        self.backlog.clear();
        self.completions.clear();
        self.retrying.clear();
        self.regions.clear();
        self.control.record(|s| s.releases += 1);
        info!("{}: released qp {:#x}", self.name, self.qpn);
    }
}

impl Drop for MockVerbs {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DeviceConfig, descriptor::ConnectionDescriptor, qp::QpStateMachine};

    fn descriptor(v: &MockVerbs) -> ConnectionDescriptor {
        ConnectionDescriptor {
            lid: v.port_attr().lid,
            qp_num: v.qp_num(),
            gid: v.gid(),
        }
    }

    fn connect(a: &mut MockVerbs, b: &mut MockVerbs) {
        let (da, db) = (descriptor(a), descriptor(b));
        let cfg = DeviceConfig::default();
        QpStateMachine::new().connect(a, &db, &cfg).unwrap();
        QpStateMachine::new().connect(b, &da, &cfg).unwrap();
    }

    fn drain(v: &mut MockVerbs) -> Vec<WorkCompletion> {
        let mut wc = vec![WorkCompletion::default(); 16];
        let n = v.poll_cq(&mut wc).unwrap();
        wc.truncate(n);
        wc
    }

    #[test]
    fn send_with_imm_lands_in_posted_receive() {
        let (mut a, mut b) = MockVerbs::pair(QpCaps::for_concurrency(2));
        connect(&mut a, &mut b);
        let mut src = vec![0xabu8; 64];
        let mut dst = vec![0u8; 64];
        let ka = a
            .reg_mr(src.as_mut_ptr() as u64, 64, AccessFlags::LOCAL_WRITE)
            .unwrap();
        let kb = b
            .reg_mr(dst.as_mut_ptr() as u64, 64, AccessFlags::LOCAL_WRITE)
            .unwrap();
        b.post_recv(&RecvWr {
            wr_id: 1,
            sge: Sge {
                addr: dst.as_ptr() as u64,
                length: 64,
                lkey: kb.lkey,
            },
        })
        .unwrap();
        a.post_send(&SendWr {
            wr_id: 2,
            sge: Sge {
                addr: src.as_ptr() as u64,
                length: 64,
                lkey: ka.lkey,
            },
            imm_data: 2u32.to_be(),
        })
        .unwrap();

        let sent = drain(&mut a);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, Some(WcOpcode::Send));
        let recvd = drain(&mut b);
        assert_eq!(recvd.len(), 1);
        assert_eq!(recvd[0].wr_id, 1);
        assert_eq!(recvd[0].imm_data, Some(2u32.to_be()));
        assert_eq!(dst, src);
    }

    #[test]
    fn message_waits_for_receive() {
        let (mut a, mut b) = MockVerbs::pair(QpCaps::for_concurrency(2));
        connect(&mut a, &mut b);
        let mut buf = vec![0u8; 32];
        let ka = a
            .reg_mr(buf.as_mut_ptr() as u64, 16, AccessFlags::LOCAL_WRITE)
            .unwrap();
        let kb = b
            .reg_mr(buf[16..].as_mut_ptr() as u64, 16, AccessFlags::LOCAL_WRITE)
            .unwrap();
        a.post_send(&SendWr {
            wr_id: 0,
            sge: Sge {
                addr: buf.as_ptr() as u64,
                length: 16,
                lkey: ka.lkey,
            },
            imm_data: 0,
        })
        .unwrap();
        assert!(drain(&mut b).is_empty());
        b.post_recv(&RecvWr {
            wr_id: 9,
            sge: Sge {
                addr: buf[16..].as_ptr() as u64,
                length: 16,
                lkey: kb.lkey,
            },
        })
        .unwrap();
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[test]
    fn send_requires_ready_to_send() {
        let (mut a, _b) = MockVerbs::pair(QpCaps::for_concurrency(1));
        let err = a
            .post_send(&SendWr {
                wr_id: 0,
                sge: Sge::default(),
                imm_data: 0,
            })
            .unwrap_err();
        assert!(matches!(err, BenchError::Submission(_)));
    }

    #[test]
    fn receive_queue_capacity_is_enforced() {
        let (mut a, mut b) = MockVerbs::pair(QpCaps {
            max_send_wr: 1,
            max_recv_wr: 1,
        });
        connect(&mut a, &mut b);
        let mut buf = vec![0u8; 8];
        let k = a
            .reg_mr(buf.as_mut_ptr() as u64, 8, AccessFlags::LOCAL_WRITE)
            .unwrap();
        let wr = RecvWr {
            wr_id: 0,
            sge: Sge {
                addr: buf.as_ptr() as u64,
                length: 8,
                lkey: k.lkey,
            },
        };
        a.post_recv(&wr).unwrap();
        assert!(matches!(
            a.post_recv(&wr).unwrap_err(),
            BenchError::Submission(_)
        ));
    }

    #[test]
    fn ethernet_pair_requires_global_route() {
        let (mut a, b) = MockVerbs::pair_with(QpCaps::for_concurrency(1), LinkLayer::Ethernet);
        assert!(!b.gid().is_zero());
        assert_eq!(a.port_attr().link_layer, LinkLayer::Ethernet);
        let cfg = DeviceConfig::default();
        QpStateMachine::new()
            .connect(&mut a, &descriptor(&b), &cfg)
            .unwrap();
    }

    #[test]
    fn injected_failure_and_release() {
        let (mut a, mut b) = MockVerbs::pair(QpCaps::for_concurrency(2));
        connect(&mut a, &mut b);
        let ctl = a.controller();
        ctl.inject_failure(0, WC_RETRY_EXC_ERR);
        let mut buf = vec![0u8; 8];
        let k = a
            .reg_mr(buf.as_mut_ptr() as u64, 8, AccessFlags::LOCAL_WRITE)
            .unwrap();
        a.post_send(&SendWr {
            wr_id: 5,
            sge: Sge {
                addr: buf.as_ptr() as u64,
                length: 8,
                lkey: k.lkey,
            },
            imm_data: 0,
        })
        .unwrap();
        let wc = drain(&mut a);
        assert_eq!(wc[0].status, WC_RETRY_EXC_ERR);
        assert_eq!(wc[0].wr_id, 5);

        a.release();
        a.release();
        assert_eq!(ctl.stats().releases, 1);
        drop(a);
        assert_eq!(ctl.stats().releases, 1);
    }

    #[test]
    fn send_to_released_peer_fails() {
        let (mut a, mut b) = MockVerbs::pair(QpCaps::for_concurrency(1));
        connect(&mut a, &mut b);
        drop(b);
        let mut buf = vec![0u8; 8];
        let k = a
            .reg_mr(buf.as_mut_ptr() as u64, 8, AccessFlags::LOCAL_WRITE)
            .unwrap();
        a.post_send(&SendWr {
            wr_id: 1,
            sge: Sge {
                addr: buf.as_ptr() as u64,
                length: 8,
                lkey: k.lkey,
            },
            imm_data: 0,
        })
        .unwrap();
        assert!(drain(&mut a).is_empty());
        std::thread::sleep(RETRY_DELAY);
        assert_eq!(drain(&mut a)[0].status, WC_RETRY_EXC_ERR);
    }

    #[test]
    fn receives_flush_after_peer_leaves_and_wire_drains() {
        let (mut a, mut b) = MockVerbs::pair(QpCaps::for_concurrency(2));
        connect(&mut a, &mut b);
        let mut src = vec![1u8; 8];
        let mut dst = vec![0u8; 16];
        let ka = a
            .reg_mr(src.as_mut_ptr() as u64, 8, AccessFlags::LOCAL_WRITE)
            .unwrap();
        let kb = b
            .reg_mr(dst.as_mut_ptr() as u64, 16, AccessFlags::LOCAL_WRITE)
            .unwrap();
        for (wr_id, offset) in [(10, 0), (11, 8)] {
            b.post_recv(&RecvWr {
                wr_id,
                sge: Sge {
                    addr: dst.as_ptr() as u64 + offset,
                    length: 8,
                    lkey: kb.lkey,
                },
            })
            .unwrap();
        }
        a.post_send(&SendWr {
            wr_id: 1,
            sge: Sge {
                addr: src.as_ptr() as u64,
                length: 8,
                lkey: ka.lkey,
            },
            imm_data: 2u32.to_be(),
        })
        .unwrap();
        drop(a);

        let wc = drain(&mut b);
        assert_eq!(wc.len(), 2);
        assert_eq!((wc[0].wr_id, wc[0].status), (10, WcStatus::Success));
        assert_eq!((wc[1].wr_id, wc[1].status), (11, WC_WR_FLUSH_ERR));
        assert!(drain(&mut b).is_empty());
    }
}
