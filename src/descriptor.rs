//! Connection descriptor and its fixed-size wire record.

use std::{
    fmt,
    io::{Read, Write},
};

use bytemuck::{Pod, Zeroable};

use crate::{constants::DESCRIPTOR_WIRE_SIZE, error::BenchError, error::Result};

/// 128-bit global address identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub fn raw(&self) -> [u8; 16] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// Addressing information one side needs to connect to the other.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub lid: u16,
    pub qp_num: u32,
    pub gid: Gid,
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LID {:#06x}, QPN {:#08x}, GID {}",
            self.lid, self.qp_num, self.gid
        )
    }
}

/// Record layout on the wire: fields packed back to back in host order.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DescriptorWire {
    lid: u16,
    qp_num: u32,
    gid: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<DescriptorWire>() == DESCRIPTOR_WIRE_SIZE);

impl From<&ConnectionDescriptor> for DescriptorWire {
    fn from(desc: &ConnectionDescriptor) -> Self {
        Self {
            lid: desc.lid,
            qp_num: desc.qp_num,
            gid: desc.gid.0,
        }
    }
}

impl From<DescriptorWire> for ConnectionDescriptor {
    fn from(wire: DescriptorWire) -> Self {
        Self {
            lid: wire.lid,
            qp_num: wire.qp_num,
            gid: Gid(wire.gid),
        }
    }
}

/// Writes the whole descriptor record, a partial write is fatal.
pub fn send_descriptor<W: Write>(channel: &mut W, local: &ConnectionDescriptor) -> Result<()> {
    let wire = DescriptorWire::from(local);
    channel
        .write_all(bytemuck::bytes_of(&wire))
        .and_then(|()| channel.flush())
        .map_err(|e| BenchError::oob("connection descriptor", e))
}

/// Reads exactly one descriptor record, a partial read is fatal.
pub fn receive_descriptor<R: Read>(channel: &mut R) -> Result<ConnectionDescriptor> {
    let mut buf = [0u8; DESCRIPTOR_WIRE_SIZE];
    channel
        .read_exact(&mut buf)
        .map_err(|e| BenchError::oob("connection descriptor", e))?;
    let wire: DescriptorWire = bytemuck::pod_read_unaligned(&buf);
    Ok(wire.into())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample() -> ConnectionDescriptor {
        ConnectionDescriptor {
            lid: 0x12,
            qp_num: 0x00ab_cdef,
            gid: Gid([
                0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x02, 0x1b, 0x21, 0xff, 0xfe, 0x3c, 0x4d, 0x5e,
            ]),
        }
    }

    #[test]
    fn record_is_host_order_and_packed() {
        let mut out = Vec::new();
        send_descriptor(&mut out, &sample()).unwrap();
        assert_eq!(out.len(), DESCRIPTOR_WIRE_SIZE);
        assert_eq!(&out[0..2], &0x12u16.to_ne_bytes());
        assert_eq!(&out[2..6], &0x00ab_cdefu32.to_ne_bytes());
        assert_eq!(&out[6..], &sample().gid.0);
        assert_eq!(receive_descriptor(&mut Cursor::new(out)).unwrap(), sample());
    }

    #[test]
    fn short_record_is_fatal() {
        let mut out = Vec::new();
        send_descriptor(&mut out, &sample()).unwrap();
        out.truncate(DESCRIPTOR_WIRE_SIZE - 1);
        let err = receive_descriptor(&mut Cursor::new(out)).unwrap_err();
        assert!(matches!(err, BenchError::Setup(_)));
    }

    #[test]
    fn gid_display() {
        assert_eq!(
            sample().gid.to_string(),
            "fe80:0000:0000:0000:021b:21ff:fe3c:4d5e"
        );
        assert!(Gid::default().is_zero());
    }
}
