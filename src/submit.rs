//! Posting sends and receives over ring slots, and attributing completions.

use std::fmt;

use crate::{
    connection::Connection,
    error::{BenchError, Result},
    verbs::{RecvWr, SendWr, VerbsOps, WcOpcode, WcStatus, WorkCompletion},
};

/// Control tag carried in the immediate data of every send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkTag {
    Start,
    Stop,
    Regular,
}

impl WorkTag {
    pub fn value(self) -> u32 {
        match self {
            WorkTag::Start => 0,
            WorkTag::Stop => 1,
            WorkTag::Regular => 2,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            0 => Some(WorkTag::Start),
            1 => Some(WorkTag::Stop),
            2 => Some(WorkTag::Regular),
            _ => None,
        }
    }

    /// Immediate data in network byte order
    pub fn to_imm(self) -> u32 {
        self.value().to_be()
    }

    pub fn from_imm(imm: u32) -> Option<Self> {
        Self::from_value(u32::from_be(imm))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Send,
    Recv,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Send => f.write_str("send"),
            OpKind::Recv => f.write_str("recv"),
        }
    }
}

const RECV_BIT: u64 = 1 << 63;
const TAG_SHIFT: u32 = 32;
const TAG_MASK: u64 = 0xff;
const NO_TAG: u64 = TAG_MASK;
const SLOT_MASK: u64 = 0xffff_ffff;

/// Identity of a posted operation, packed into its `wr_id`.
///
/// Bit 63 marks receives, bits 32..40 hold the tag of a send and the low
/// 32 bits hold the ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkId {
    pub kind: OpKind,
    pub tag: Option<WorkTag>,
    pub slot: usize,
}

impl WorkId {
    pub fn encode(self) -> u64 {
        let kind = match self.kind {
            OpKind::Send => 0,
            OpKind::Recv => RECV_BIT,
        };
        let tag = self.tag.map_or(NO_TAG, |t| u64::from(t.value()));
        kind | (tag << TAG_SHIFT) | (self.slot as u64 & SLOT_MASK)
    }

    pub fn decode(wr_id: u64) -> Self {
        let kind = if wr_id & RECV_BIT == 0 {
            OpKind::Send
        } else {
            OpKind::Recv
        };
        let tag = u32::try_from((wr_id >> TAG_SHIFT) & TAG_MASK)
            .ok()
            .and_then(WorkTag::from_value);
        Self {
            kind,
            tag,
            slot: (wr_id & SLOT_MASK) as usize,
        }
    }
}

/// A successful completion, attributed to its operation and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub kind: OpKind,
    pub status: WcStatus,
    pub wr_id: u64,
    pub slot: usize,
    /// Tag received in the immediate data, or the tag a send carried
    pub tag: Option<WorkTag>,
}

impl<V: VerbsOps> Connection<V> {
    /// Posts a receive into the slot under the receive cursor.
    pub fn post_receive(&mut self) -> Result<usize> {
        self.ensure_live()?;
        if self.inflight.recvs.len() >= self.inflight.recv_limit {
            return Err(BenchError::Submission(format!(
                "{} receives already outstanding",
                self.inflight.recvs.len()
            )));
        }
        let slot = self.ring.next_recv_slot();
        if self.inflight.recvs.contains(&slot) {
            return Err(BenchError::Submission(format!(
                "receive slot {slot} still in use"
            )));
        }
        let wr = RecvWr {
            wr_id: WorkId {
                kind: OpKind::Recv,
                tag: None,
                slot,
            }
            .encode(),
            sge: self.ring.sge(slot),
        };
        self.verbs.post_recv(&wr)?;
        self.inflight.recvs.push_back(slot);
        Ok(slot)
    }

    /// Posts a signaled send of the slot under the send cursor.
    pub fn post_send(&mut self, tag: WorkTag) -> Result<usize> {
        self.ensure_live()?;
        self.check_send_room()?;
        let slot = self.ring.next_send_slot();
        self.submit_send(slot, tag)?;
        Ok(slot)
    }

    /// Posts a signaled send of `slot` as it is, without moving the cursor.
    pub fn post_send_from(&mut self, slot: usize, tag: WorkTag) -> Result<()> {
        self.ensure_live()?;
        if slot >= self.ring.slots() {
            return Err(BenchError::Submission(format!("slot {slot} out of range")));
        }
        self.check_send_room()?;
        self.submit_send(slot, tag)
    }

    /// Fills the receive queue up to the concurrency limit.
    pub fn arm_receives(&mut self) -> Result<()> {
        while self.inflight.recvs.len() < self.inflight.recv_limit {
            self.post_receive()?;
        }
        Ok(())
    }

    fn check_send_room(&self) -> Result<()> {
        if self.inflight.sends >= self.inflight.send_limit {
            return Err(BenchError::Submission(format!(
                "{} sends already outstanding",
                self.inflight.sends
            )));
        }
        Ok(())
    }

    fn submit_send(&mut self, slot: usize, tag: WorkTag) -> Result<()> {
        let wr = SendWr {
            wr_id: WorkId {
                kind: OpKind::Send,
                tag: Some(tag),
                slot,
            }
            .encode(),
            sge: self.ring.sge(slot),
            imm_data: tag.to_imm(),
        };
        self.verbs.post_send(&wr)?;
        self.inflight.sends += 1;
        Ok(())
    }

    /// Validates one completion and retires the operation it belongs to.
    ///
    /// Receives must complete in the order they were posted.
    pub fn complete(&mut self, wc: &WorkCompletion) -> Result<CompletionRecord> {
        let id = WorkId::decode(wc.wr_id);
        let kind = match wc.opcode {
            Some(WcOpcode::Send) => OpKind::Send,
            Some(WcOpcode::Recv) => OpKind::Recv,
            None => id.kind,
        };
        if !wc.status.is_success() {
            return Err(BenchError::Completion {
                kind,
                status: wc.status.to_string(),
                wr_id: wc.wr_id,
            });
        }
        let tag = match kind {
            OpKind::Recv => {
                match self.inflight.recvs.pop_front() {
                    Some(expected) if expected == id.slot => {}
                    Some(expected) => {
                        return Err(BenchError::RingOrder {
                            expected,
                            actual: id.slot,
                        })
                    }
                    None => {
                        return Err(BenchError::InvalidInput(format!(
                            "receive completion for slot {} with none outstanding",
                            id.slot
                        )))
                    }
                }
                let tag = wc.imm_data.and_then(WorkTag::from_imm);
                if tag.is_none() {
                    return Err(BenchError::InvalidInput(format!(
                        "receive without a control tag (imm={:?})",
                        wc.imm_data
                    )));
                }
                tag
            }
            OpKind::Send => {
                self.inflight.sends = self.inflight.sends.saturating_sub(1);
                id.tag
            }
        };
        Ok(CompletionRecord {
            kind,
            status: wc.status,
            wr_id: wc.wr_id,
            slot: id.slot,
            tag,
        })
    }
}
