//! Seam between the benchmark and the RDMA verbs provider.

pub mod ibv;
pub mod mock;
mod types;

pub use types::{
    AccessFlags, LinkLayer, MrKeys, Mtu, PortAttr, QpCaps, RecvWr, SendWr, Sge, WcOpcode,
    WcStatus, WorkCompletion,
};

use crate::{descriptor::Gid, error::Result, qp::QpAttr};

/// Operations on one device context owning a single protection domain,
/// completion queue and reliable-connected queue pair.
pub trait VerbsOps: Send {
    /// Name of the opened device
    fn device_name(&self) -> &str;

    /// Attributes of the port the queue pair is bound to
    fn port_attr(&self) -> PortAttr;

    /// Local GID, zero when the port does not use global addressing
    fn gid(&self) -> Gid;

    /// Number of the local queue pair
    fn qp_num(&self) -> u32;

    /// Registers `length` bytes at `addr` with the protection domain
    fn reg_mr(&mut self, addr: u64, length: usize, access: AccessFlags) -> Result<MrKeys>;

    /// Applies one state transition to the queue pair
    fn modify_qp(&mut self, attr: &QpAttr) -> Result<()>;

    /// Posts a send to the send queue
    fn post_send(&mut self, wr: &SendWr) -> Result<()>;

    /// Posts a receive to the receive queue
    fn post_recv(&mut self, wr: &RecvWr) -> Result<()>;

    /// Drains up to `wc.len()` completions without blocking
    fn poll_cq(&mut self, wc: &mut [WorkCompletion]) -> Result<usize>;

    /// Releases every resource held, calling it again is a no-op
    fn release(&mut self);
}
