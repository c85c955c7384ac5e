//! Queue pair state machine for the reliable connection.

use log::{debug, info};

use crate::{
    config::DeviceConfig,
    constants::{
        QP_MAX_RD_ATOMIC, QP_MIN_RNR_TIMER, QP_PKEY_INDEX, QP_RETRY_CNT, QP_RNR_RETRY,
        QP_START_PSN, QP_TIMEOUT,
    },
    descriptor::{ConnectionDescriptor, Gid},
    error::{BenchError, Result},
    verbs::{AccessFlags, LinkLayer, Mtu, PortAttr, VerbsOps},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

impl QpState {
    /// The only state reachable from `self` during connection setup.
    pub fn successor(self) -> Option<QpState> {
        match self {
            QpState::Reset => Some(QpState::Init),
            QpState::Init => Some(QpState::ReadyToReceive),
            QpState::ReadyToReceive => Some(QpState::ReadyToSend),
            QpState::ReadyToSend => None,
        }
    }
}

/// Destination addressing used by the ready-to-receive transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// Subnet-local routing by LID
    Local { dlid: u16 },
    /// Routed addressing with a global route header
    Global {
        dgid: Gid,
        dlid: u16,
        sgid_index: u8,
        hop_limit: u8,
    },
}

impl AddressMode {
    /// Ethernet ports require a global route header, every other link layer
    /// is addressed by LID.
    pub fn select(link_layer: LinkLayer, remote: &ConnectionDescriptor, cfg: &DeviceConfig) -> Self {
        match link_layer {
            LinkLayer::Ethernet => AddressMode::Global {
                dgid: remote.gid,
                dlid: remote.lid,
                sgid_index: cfg.gid_index,
                hop_limit: cfg.hop_limit,
            },
            LinkLayer::InfiniBand | LinkLayer::Unspecified => {
                AddressMode::Local { dlid: remote.lid }
            }
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, AddressMode::Global { .. })
    }
}

/// Attribute set of a single transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpAttr {
    Init {
        port: u8,
        pkey_index: u16,
        access: AccessFlags,
    },
    Rtr {
        port: u8,
        path_mtu: Mtu,
        dest_qp_num: u32,
        rq_psn: u32,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
        service_level: u8,
        address: AddressMode,
    },
    Rts {
        sq_psn: u32,
        timeout: u8,
        retry_cnt: u8,
        rnr_retry: u8,
        max_rd_atomic: u8,
    },
}

impl QpAttr {
    pub fn target(&self) -> QpState {
        match *self {
            QpAttr::Init { .. } => QpState::Init,
            QpAttr::Rtr { .. } => QpState::ReadyToReceive,
            QpAttr::Rts { .. } => QpState::ReadyToSend,
        }
    }

    pub fn init(cfg: &DeviceConfig) -> Self {
        QpAttr::Init {
            port: cfg.ib_port,
            pkey_index: QP_PKEY_INDEX,
            access: AccessFlags::LOCAL_WRITE
                | AccessFlags::REMOTE_READ
                | AccessFlags::REMOTE_WRITE
                | AccessFlags::REMOTE_ATOMIC,
        }
    }

    pub fn rtr(port: &PortAttr, remote: &ConnectionDescriptor, cfg: &DeviceConfig) -> Self {
        QpAttr::Rtr {
            port: cfg.ib_port,
            path_mtu: port.active_mtu,
            dest_qp_num: remote.qp_num,
            rq_psn: QP_START_PSN,
            max_dest_rd_atomic: QP_MAX_RD_ATOMIC,
            min_rnr_timer: QP_MIN_RNR_TIMER,
            service_level: cfg.service_level,
            address: AddressMode::select(port.link_layer, remote, cfg),
        }
    }

    pub fn rts() -> Self {
        QpAttr::Rts {
            sq_psn: QP_START_PSN,
            timeout: QP_TIMEOUT,
            retry_cnt: QP_RETRY_CNT,
            rnr_retry: QP_RNR_RETRY,
            max_rd_atomic: QP_MAX_RD_ATOMIC,
        }
    }
}

/// Tracks the queue pair through RESET -> INIT -> RTR -> RTS.
///
/// A rejected transition leaves the state unchanged; there is no rollback
/// and the owning connection has to be torn down.
#[derive(Debug, Default)]
pub struct QpStateMachine {
    state: QpState,
}

impl QpStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    /// Applies a single transition, which must target the successor state.
    pub fn transition<V: VerbsOps + ?Sized>(&mut self, verbs: &mut V, attr: &QpAttr) -> Result<()> {
        let from = self.state;
        let to = attr.target();
        if from.successor() != Some(to) {
            return Err(BenchError::Transition {
                from,
                to,
                reason: "transition out of order".into(),
            });
        }
        verbs
            .modify_qp(attr)
            .map_err(|e| BenchError::Transition {
                from,
                to,
                reason: e.to_string(),
            })?;
        debug!("qp {:#x}: {from:?} -> {to:?}", verbs.qp_num());
        self.state = to;
        Ok(())
    }

    /// Drives the queue pair to ready-to-send against `remote`.
    pub fn connect<V: VerbsOps + ?Sized>(
        &mut self,
        verbs: &mut V,
        remote: &ConnectionDescriptor,
        cfg: &DeviceConfig,
    ) -> Result<()> {
        let port = verbs.port_attr();
        self.transition(verbs, &QpAttr::init(cfg))?;
        let rtr = QpAttr::rtr(&port, remote, cfg);
        if let QpAttr::Rtr { address, .. } = rtr {
            info!(
                "connecting qp {:#x} to remote qp {:#x} using {} addressing",
                verbs.qp_num(),
                remote.qp_num,
                if address.is_global() { "global" } else { "local" }
            );
        }
        self.transition(verbs, &rtr)?;
        self.transition(verbs, &QpAttr::rts())?;
        info!("qp {:#x} ready to send", verbs.qp_num());
        Ok(())
    }
}
