//! Verbs provider backed by libibverbs.

use std::{
    ffi::CStr,
    io, mem,
    os::raw::{c_int, c_void},
    ptr,
};

use ibverbs_sys::{
    ibv_qp_attr_mask, ibv_qp_state, ibv_send_flags, ibv_wc_flags, ibv_wc_opcode, ibv_wc_status,
    ibv_wr_opcode,
};
use log::{debug, info, warn};

use super::{
    AccessFlags, LinkLayer, MrKeys, Mtu, PortAttr, QpCaps, RecvWr, SendWr, VerbsOps, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::{
    config::DeviceConfig,
    descriptor::Gid,
    error::{BenchError, Result},
    qp::{AddressMode, QpAttr},
};

const LINK_LAYER_INFINIBAND: u8 = ibverbs_sys::IBV_LINK_LAYER_INFINIBAND as u8;
const LINK_LAYER_ETHERNET: u8 = ibverbs_sys::IBV_LINK_LAYER_ETHERNET as u8;

fn link_layer_from_raw(raw: u8) -> LinkLayer {
    match raw {
        LINK_LAYER_INFINIBAND => LinkLayer::InfiniBand,
        LINK_LAYER_ETHERNET => LinkLayer::Ethernet,
        _ => LinkLayer::Unspecified,
    }
}

fn mtu_from_raw(raw: ibverbs_sys::ibv_mtu) -> Mtu {
    match raw {
        ibverbs_sys::IBV_MTU_256 => Mtu::Mtu256,
        ibverbs_sys::IBV_MTU_512 => Mtu::Mtu512,
        ibverbs_sys::IBV_MTU_2048 => Mtu::Mtu2048,
        ibverbs_sys::IBV_MTU_4096 => Mtu::Mtu4096,
        _ => Mtu::Mtu1024,
    }
}

fn mtu_to_raw(mtu: Mtu) -> ibverbs_sys::ibv_mtu {
    match mtu {
        Mtu::Mtu256 => ibverbs_sys::IBV_MTU_256,
        Mtu::Mtu512 => ibverbs_sys::IBV_MTU_512,
        Mtu::Mtu1024 => ibverbs_sys::IBV_MTU_1024,
        Mtu::Mtu2048 => ibverbs_sys::IBV_MTU_2048,
        Mtu::Mtu4096 => ibverbs_sys::IBV_MTU_4096,
    }
}

fn status_from_raw(status: ibv_wc_status::Type) -> WcStatus {
    if status == ibv_wc_status::IBV_WC_SUCCESS {
        return WcStatus::Success;
    }
    // SAFETY: libibverbs returns a pointer to a static string table
    let reason = unsafe { CStr::from_ptr(ibverbs_sys::ibv_wc_status_str(status)) }
        .to_str()
        .unwrap_or("unknown status");
    WcStatus::Failed {
        code: status,
        reason,
    }
}

fn os_error(call: &str, rc: c_int) -> String {
    format!("{call} failed: {}", io::Error::from_raw_os_error(rc.abs()))
}

/// Device context owning one protection domain, one completion queue shared
/// by both work queues, and one RC queue pair.
///
/// Handles are nulled as they are destroyed, so a partially opened device
/// and a repeated [`VerbsOps::release`] are both safe.
pub struct IbvDevice {
    name: String,
    ctx: *mut ibverbs_sys::ibv_context,
    pd: *mut ibverbs_sys::ibv_pd,
    cq: *mut ibverbs_sys::ibv_cq,
    qp: *mut ibverbs_sys::ibv_qp,
    mrs: Vec<*mut ibverbs_sys::ibv_mr>,
    port: PortAttr,
    gid: Gid,
    wc_buf: Vec<ibverbs_sys::ibv_wc>,
}

// SAFETY: the handles are only used by the thread owning the device
unsafe impl Send for IbvDevice {}

impl IbvDevice {
    /// Opens the configured device (or the first one) and creates the
    /// protection domain, completion queue and queue pair.
    pub fn open(cfg: &DeviceConfig, caps: QpCaps) -> Result<Self> {
        // SAFETY: must precede every other verbs call
        let rc = unsafe { ibverbs_sys::ibv_fork_init() };
        if rc != 0 {
            return Err(BenchError::Setup(os_error("ibv_fork_init", rc)));
        }

        let (name, ctx) = Self::open_context(cfg.name.as_deref())?;
        let mut dev = Self {
            name,
            ctx,
            pd: ptr::null_mut(),
            cq: ptr::null_mut(),
            qp: ptr::null_mut(),
            mrs: Vec::new(),
            port: PortAttr::default(),
            gid: Gid::default(),
            wc_buf: Vec::new(),
        };

        // From here on dropping `dev` releases whatever has been created.
        unsafe {
            dev.pd = ibverbs_sys::ibv_alloc_pd(dev.ctx);
            if dev.pd.is_null() {
                return Err(BenchError::Setup("ibv_alloc_pd failed".into()));
            }

            let mut port_attr: ibverbs_sys::ibv_port_attr = mem::zeroed();
            let rc = ibverbs_sys::ibv_query_port(
                dev.ctx,
                cfg.ib_port,
                ptr::addr_of_mut!(port_attr).cast(),
            );
            if rc != 0 {
                return Err(BenchError::Setup(os_error("ibv_query_port", rc)));
            }
            dev.port = PortAttr {
                lid: port_attr.lid,
                link_layer: link_layer_from_raw(port_attr.link_layer),
                active_mtu: mtu_from_raw(port_attr.active_mtu),
            };

            if dev.port.link_layer == LinkLayer::Ethernet {
                let mut gid: ibverbs_sys::ibv_gid = mem::zeroed();
                let rc = ibverbs_sys::ibv_query_gid(
                    dev.ctx,
                    cfg.ib_port,
                    c_int::from(cfg.gid_index),
                    &mut gid,
                );
                if rc != 0 {
                    return Err(BenchError::Setup(os_error("ibv_query_gid", rc)));
                }
                dev.gid = Gid(gid.raw);
            }

            let mut dev_attr: ibverbs_sys::ibv_device_attr = mem::zeroed();
            let rc = ibverbs_sys::ibv_query_device(dev.ctx, &mut dev_attr);
            if rc != 0 {
                return Err(BenchError::Setup(os_error("ibv_query_device", rc)));
            }
            let cq_depth = cfg
                .cq_depth
                .and_then(|d| c_int::try_from(d).ok())
                .unwrap_or(dev_attr.max_cqe);

            dev.cq = ibverbs_sys::ibv_create_cq(
                dev.ctx,
                cq_depth,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if dev.cq.is_null() {
                return Err(BenchError::Setup(format!(
                    "ibv_create_cq with {cq_depth} entries failed"
                )));
            }

            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = mem::zeroed();
            init_attr.send_cq = dev.cq;
            init_attr.recv_cq = dev.cq;
            init_attr.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            init_attr.cap.max_send_wr = caps.max_send_wr;
            init_attr.cap.max_recv_wr = caps.max_recv_wr;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;
            dev.qp = ibverbs_sys::ibv_create_qp(dev.pd, &mut init_attr);
            if dev.qp.is_null() {
                return Err(BenchError::Setup("ibv_create_qp failed".into()));
            }

            info!(
                "opened {}: port {} lid {:#x} {:?} mtu {}, cq depth {cq_depth}, qpn {:#x}",
                dev.name,
                cfg.ib_port,
                dev.port.lid,
                dev.port.link_layer,
                dev.port.active_mtu.bytes(),
                (*dev.qp).qp_num,
            );
        }
        Ok(dev)
    }

    fn open_context(wanted: Option<&str>) -> Result<(String, *mut ibverbs_sys::ibv_context)> {
        unsafe {
            let mut num_devices: c_int = 0;
            let list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if list.is_null() {
                return Err(BenchError::Setup("ibv_get_device_list failed".into()));
            }
            let count = usize::try_from(num_devices).unwrap_or(0);
            let devices = std::slice::from_raw_parts(list, count);
            let device_name = |dev: *mut ibverbs_sys::ibv_device| {
                CStr::from_ptr(ibverbs_sys::ibv_get_device_name(dev))
                    .to_string_lossy()
                    .into_owned()
            };
            let chosen = match wanted {
                Some(name) => devices.iter().copied().find(|d| device_name(*d) == name),
                None => devices.first().copied(),
            };
            let Some(dev) = chosen else {
                ibverbs_sys::ibv_free_device_list(list);
                return Err(BenchError::Setup(match wanted {
                    Some(name) => format!("device {name} not found"),
                    None => "no RDMA device found".into(),
                }));
            };
            let name = device_name(dev);
            let ctx = ibverbs_sys::ibv_open_device(dev);
            ibverbs_sys::ibv_free_device_list(list);
            if ctx.is_null() {
                return Err(BenchError::Setup(format!("ibv_open_device {name} failed")));
            }
            Ok((name, ctx))
        }
    }

    fn qp_attr_from(attr: &QpAttr) -> (ibverbs_sys::ibv_qp_attr, ibv_qp_attr_mask) {
        // SAFETY: all-zero is a valid ibv_qp_attr
        let mut qp_attr: ibverbs_sys::ibv_qp_attr = unsafe { mem::zeroed() };
        let mask = match *attr {
            QpAttr::Init {
                port,
                pkey_index,
                access,
            } => {
                qp_attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                qp_attr.pkey_index = pkey_index;
                qp_attr.port_num = port;
                qp_attr.qp_access_flags = access.0;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            QpAttr::Rtr {
                port,
                path_mtu,
                dest_qp_num,
                rq_psn,
                max_dest_rd_atomic,
                min_rnr_timer,
                service_level,
                address,
            } => {
                qp_attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                qp_attr.path_mtu = mtu_to_raw(path_mtu);
                qp_attr.dest_qp_num = dest_qp_num;
                qp_attr.rq_psn = rq_psn;
                qp_attr.max_dest_rd_atomic = max_dest_rd_atomic;
                qp_attr.min_rnr_timer = min_rnr_timer;
                qp_attr.ah_attr.sl = service_level;
                qp_attr.ah_attr.src_path_bits = 0;
                qp_attr.ah_attr.port_num = port;
                match address {
                    AddressMode::Local { dlid } => {
                        qp_attr.ah_attr.is_global = 0;
                        qp_attr.ah_attr.dlid = dlid;
                    }
                    AddressMode::Global {
                        dgid,
                        dlid,
                        sgid_index,
                        hop_limit,
                    } => {
                        qp_attr.ah_attr.is_global = 1;
                        qp_attr.ah_attr.dlid = dlid;
                        qp_attr.ah_attr.grh.dgid.raw = dgid.raw();
                        qp_attr.ah_attr.grh.sgid_index = sgid_index;
                        qp_attr.ah_attr.grh.hop_limit = hop_limit;
                    }
                }
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            QpAttr::Rts {
                sq_psn,
                timeout,
                retry_cnt,
                rnr_retry,
                max_rd_atomic,
            } => {
                qp_attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                qp_attr.sq_psn = sq_psn;
                qp_attr.timeout = timeout;
                qp_attr.retry_cnt = retry_cnt;
                qp_attr.rnr_retry = rnr_retry;
                qp_attr.max_rd_atomic = max_rd_atomic;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };
        (qp_attr, mask)
    }

    fn convert_wc(wc: &ibverbs_sys::ibv_wc) -> WorkCompletion {
        let opcode = match wc.opcode {
            ibv_wc_opcode::IBV_WC_SEND => Some(WcOpcode::Send),
            ibv_wc_opcode::IBV_WC_RECV => Some(WcOpcode::Recv),
            _ => None,
        };
        let imm_data = (wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0)
            // SAFETY: the flag marks the union as holding immediate data
            .then(|| unsafe { wc.__bindgen_anon_1.imm_data });
        WorkCompletion {
            wr_id: wc.wr_id,
            status: status_from_raw(wc.status),
            opcode,
            byte_len: wc.byte_len,
            imm_data,
        }
    }
}

impl VerbsOps for IbvDevice {
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
        if self.qp.is_null() {
            return 0;
        }
        // SAFETY: qp is a live handle
        unsafe { (*self.qp).qp_num }
    }

    #[allow(clippy::as_conversions, clippy::cast_possible_wrap)]
    fn reg_mr(&mut self, addr: u64, length: usize, access: AccessFlags) -> Result<MrKeys> {
        if self.pd.is_null() {
            return Err(BenchError::Setup("protection domain released".into()));
        }
        // SAFETY: the caller keeps the buffer alive until release
        let mr = unsafe {
            ibverbs_sys::ibv_reg_mr(self.pd, addr as *mut c_void, length, access.0 as c_int)
        };
        if mr.is_null() {
            return Err(BenchError::Setup(format!(
                "ibv_reg_mr of {length} bytes failed: {}",
                io::Error::last_os_error()
            )));
        }
        self.mrs.push(mr);
        // SAFETY: mr was just returned non-null
        let keys = unsafe {
            MrKeys {
                lkey: (*mr).lkey,
                rkey: (*mr).rkey,
            }
        };
        debug!("registered {length} bytes at {addr:#x}, lkey {:#x}", keys.lkey);
        Ok(keys)
    }

    #[allow(clippy::as_conversions, clippy::cast_possible_wrap)]
    fn modify_qp(&mut self, attr: &QpAttr) -> Result<()> {
        let (mut qp_attr, mask) = Self::qp_attr_from(attr);
        // SAFETY: qp is a live handle and qp_attr outlives the call
        let rc = unsafe { ibverbs_sys::ibv_modify_qp(self.qp, &mut qp_attr, mask.0 as c_int) };
        if rc != 0 {
            return Err(BenchError::Setup(os_error("ibv_modify_qp", rc)));
        }
        Ok(())
    }

    fn post_send(&mut self, wr: &SendWr) -> Result<()> {
        let mut sge = ibverbs_sys::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        // SAFETY: all-zero is a valid ibv_send_wr
        let mut send_wr: ibverbs_sys::ibv_send_wr = unsafe { mem::zeroed() };
        send_wr.wr_id = wr.wr_id;
        send_wr.sg_list = &mut sge;
        send_wr.num_sge = 1;
        send_wr.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
        send_wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        send_wr.__bindgen_anon_1.imm_data = wr.imm_data;

        let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
        // SAFETY: qp is a live handle, post_send is a provider op of its context
        let rc = unsafe {
            match (*(*self.qp).context).ops.post_send {
                Some(post_send) => post_send(self.qp, &mut send_wr, &mut bad_wr),
                None => return Err(BenchError::Submission("provider lacks post_send".into())),
            }
        };
        if rc != 0 {
            return Err(BenchError::Submission(os_error("ibv_post_send", rc)));
        }
        Ok(())
    }

    fn post_recv(&mut self, wr: &RecvWr) -> Result<()> {
        let mut sge = ibverbs_sys::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        // SAFETY: all-zero is a valid ibv_recv_wr
        let mut recv_wr: ibverbs_sys::ibv_recv_wr = unsafe { mem::zeroed() };
        recv_wr.wr_id = wr.wr_id;
        recv_wr.sg_list = &mut sge;
        recv_wr.num_sge = 1;

        let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
        // SAFETY: qp is a live handle, post_recv is a provider op of its context
        let rc = unsafe {
            match (*(*self.qp).context).ops.post_recv {
                Some(post_recv) => post_recv(self.qp, &mut recv_wr, &mut bad_wr),
                None => return Err(BenchError::Submission("provider lacks post_recv".into())),
            }
        };
        if rc != 0 {
            return Err(BenchError::Submission(os_error("ibv_post_recv", rc)));
        }
        Ok(())
    }

    #[allow(clippy::as_conversions, clippy::cast_sign_loss)]
    fn poll_cq(&mut self, wc: &mut [WorkCompletion]) -> Result<usize> {
        if self.wc_buf.len() < wc.len() {
            self.wc_buf.resize(wc.len(), ibverbs_sys::ibv_wc::default());
        }
        let num_entries = c_int::try_from(wc.len()).unwrap_or(c_int::MAX);
        // SAFETY: cq is a live handle and wc_buf holds at least num_entries entries
        let n = unsafe {
            match (*(*self.cq).context).ops.poll_cq {
                Some(poll_cq) => poll_cq(self.cq, num_entries, self.wc_buf.as_mut_ptr()),
                None => return Err(BenchError::Setup("provider lacks poll_cq".into())),
            }
        };
        if n < 0 {
            return Err(BenchError::IoError(io::Error::other(format!(
                "ibv_poll_cq returned {n}"
            ))));
        }
        let n = n as usize;
        for (dst, src) in wc.iter_mut().zip(&self.wc_buf[..n]) {
            *dst = Self::convert_wc(src);
        }
        Ok(n)
    }

    fn release(&mut self) {
        // SAFETY: each handle is destroyed at most once and nulled afterwards,
        // in reverse order of creation
        unsafe {
            if !self.qp.is_null() {
                let rc = ibverbs_sys::ibv_destroy_qp(self.qp);
                if rc != 0 {
                    warn!("{}", os_error("ibv_destroy_qp", rc));
                }
                self.qp = ptr::null_mut();
            }
            for mr in self.mrs.drain(..) {
                let rc = ibverbs_sys::ibv_dereg_mr(mr);
                if rc != 0 {
                    warn!("{}", os_error("ibv_dereg_mr", rc));
                }
            }
            if !self.cq.is_null() {
                let rc = ibverbs_sys::ibv_destroy_cq(self.cq);
                if rc != 0 {
                    warn!("{}", os_error("ibv_destroy_cq", rc));
                }
                self.cq = ptr::null_mut();
            }
            if !self.pd.is_null() {
                let rc = ibverbs_sys::ibv_dealloc_pd(self.pd);
                if rc != 0 {
                    warn!("{}", os_error("ibv_dealloc_pd", rc));
                }
                self.pd = ptr::null_mut();
            }
            if !self.ctx.is_null() {
                let rc = ibverbs_sys::ibv_close_device(self.ctx);
                if rc != 0 {
                    warn!("{}", os_error("ibv_close_device", rc));
                }
                self.ctx = ptr::null_mut();
                info!("closed {}", self.name);
            }
        }
    }
}

impl Drop for IbvDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_conversion_is_lossless() {
        for mtu in [
            Mtu::Mtu256,
            Mtu::Mtu512,
            Mtu::Mtu1024,
            Mtu::Mtu2048,
            Mtu::Mtu4096,
        ] {
            assert_eq!(mtu_from_raw(mtu_to_raw(mtu)), mtu);
        }
    }

    #[test]
    fn link_layer_decoding() {
        assert_eq!(link_layer_from_raw(LINK_LAYER_ETHERNET), LinkLayer::Ethernet);
        assert_eq!(
            link_layer_from_raw(LINK_LAYER_INFINIBAND),
            LinkLayer::InfiniBand
        );
        assert_eq!(link_layer_from_raw(0), LinkLayer::Unspecified);
    }

    #[test]
    fn rtr_attribute_carries_global_route() {
        let attr = QpAttr::Rtr {
            port: 1,
            path_mtu: Mtu::Mtu4096,
            dest_qp_num: 0x11,
            rq_psn: 0,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
            service_level: 0,
            address: AddressMode::Global {
                dgid: Gid([7; 16]),
                dlid: 0,
                sgid_index: 3,
                hop_limit: 255,
            },
        };
        let (qp_attr, mask) = IbvDevice::qp_attr_from(&attr);
        assert_eq!(qp_attr.qp_state, ibv_qp_state::IBV_QPS_RTR);
        assert_eq!(qp_attr.path_mtu, ibverbs_sys::IBV_MTU_4096);
        assert_eq!(qp_attr.ah_attr.is_global, 1);
        assert_eq!(qp_attr.ah_attr.grh.hop_limit, 255);
        assert_eq!(qp_attr.ah_attr.grh.sgid_index, 3);
        // SAFETY: raw is the only view of the gid written above
        assert_eq!(unsafe { qp_attr.ah_attr.grh.dgid.raw }, [7; 16]);
        assert_ne!((mask & ibv_qp_attr_mask::IBV_QP_AV).0, 0);
    }
}
