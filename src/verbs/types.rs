use std::{fmt, ops::BitOr};

/// Link layer reported by a port, drives the addressing mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    #[default]
    Unspecified,
    InfiniBand,
    Ethernet,
}

/// Path MTU values supported by the transport.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    #[default]
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    pub fn bytes(self) -> u16 {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub lid: u16,
    pub link_layer: LinkLayer,
    pub active_mtu: Mtu,
}

/// Queue depths requested at queue pair creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
}

impl QpCaps {
    /// Both queues sized for `concurrency` data messages plus the control
    /// messages and echoes that may overlap with them.
    pub fn for_concurrency(concurrency: usize) -> Self {
        let depth = u32::try_from(concurrency.saturating_mul(2)).unwrap_or(u32::MAX);
        Self {
            max_send_wr: depth,
            max_recv_wr: depth,
        }
    }
}

/// Memory access permissions, bit values match the verbs ABI.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// A single scatter/gather entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Signaled send carrying immediate data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub sge: Sge,
    /// Immediate data, already in network byte order
    pub imm_data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    #[default]
    Success,
    Failed {
        code: u32,
        reason: &'static str,
    },
}

impl WcStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WcStatus::Success => f.write_str("success"),
            WcStatus::Failed { code, reason } => write!(f, "{reason} ({code})"),
        }
    }
}

/// One entry drained from the completion queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    /// Undefined by the transport for failed completions
    pub opcode: Option<WcOpcode>,
    pub byte_len: u32,
    /// Immediate data in network byte order
    pub imm_data: Option<u32>,
}
