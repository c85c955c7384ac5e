/// Default physical port used for the queue pair
pub const DEFAULT_IB_PORT: u8 = 1;

/// Default index into the port's GID table
pub const DEFAULT_GID_INDEX: u8 = 3;

/// Default service level
pub const DEFAULT_SERVICE_LEVEL: u8 = 0;

/// Hop limit carried in the global route header
pub const DEFAULT_HOP_LIMIT: u8 = 255;

/// Operations completed before the throughput timer starts
pub const DEFAULT_WARMUP_OPS: u64 = 500_000;

/// Operations after which the server sends the STOP message
pub const DEFAULT_TOTAL_OPS: u64 = 5_000_000;

/// Completions fetched by a single poll
pub const DEFAULT_POLL_BATCH: usize = 20;

/// Alignment of the message buffer
pub const BUFFER_ALIGN: usize = 4096;

/// Local ACK timeout exponent, 4.096 uS * 2^14
pub(crate) const QP_TIMEOUT: u8 = 14;

/// Transport retransmission attempts
pub(crate) const QP_RETRY_CNT: u8 = 7;

/// Receiver-not-ready retries, 7 means infinite
pub(crate) const QP_RNR_RETRY: u8 = 7;

/// Outstanding RDMA read/atomic operations in either direction
pub(crate) const QP_MAX_RD_ATOMIC: u8 = 1;

/// Minimal RNR NAK timer encoding
pub(crate) const QP_MIN_RNR_TIMER: u8 = 12;

/// Starting packet sequence number for both queues
pub(crate) const QP_START_PSN: u32 = 0;

/// Partition key index
pub(crate) const QP_PKEY_INDEX: u16 = 0;

/// Token exchanged after both queue pairs reach ready-to-send
pub const SYNC_TOKEN: [u8; 4] = *b"sync";

/// Size of a connection descriptor on the out-of-band channel
pub const DESCRIPTOR_WIRE_SIZE: usize = 22;
