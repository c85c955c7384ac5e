//! Out-of-band TCP channel used during connection setup.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
};

use log::{debug, info};

use crate::{
    bench::Role,
    constants::SYNC_TOKEN,
    descriptor::{receive_descriptor, send_descriptor, ConnectionDescriptor},
    error::{BenchError, Result},
};

/// Binds the server's listening socket on every interface.
pub fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .map_err(|e| BenchError::Setup(format!("failed to listen on port {port}: {e}")))
}

/// Accepts exactly one peer.
pub fn accept_one(listener: &TcpListener) -> Result<TcpStream> {
    let (stream, peer) = listener
        .accept()
        .map_err(|e| BenchError::Setup(format!("failed to accept peer: {e}")))?;
    stream.set_nodelay(true)?;
    info!("accepted peer {peer}");
    Ok(stream)
}

/// Connects to the server, trying every resolved address.
pub fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .map_err(|e| BenchError::Setup(format!("failed to connect to {host}:{port}: {e}")))?;
    stream.set_nodelay(true)?;
    info!("connected to {host}:{port}");
    Ok(stream)
}

/// Swaps descriptors with the peer: the server reads first, the client
/// writes first, so each side performs exactly one write and one read.
pub fn exchange_descriptors<S: Read + Write>(
    role: Role,
    channel: &mut S,
    local: &ConnectionDescriptor,
) -> Result<ConnectionDescriptor> {
    let remote = match role {
        Role::Server => {
            let remote = receive_descriptor(channel)?;
            send_descriptor(channel, local)?;
            remote
        }
        Role::Client => {
            send_descriptor(channel, local)?;
            receive_descriptor(channel)?
        }
    };
    debug!("{role}: descriptor exchange done");
    Ok(remote)
}

/// Rendezvous after both queue pairs are ready: the client writes the token
/// and waits for the echo, the server reads it and writes it back.
pub fn synchronize<S: Read + Write>(role: Role, channel: &mut S) -> Result<()> {
    let mut token = [0u8; SYNC_TOKEN.len()];
    match role {
        Role::Server => {
            read_token(channel, &mut token)?;
            write_token(channel)?;
        }
        Role::Client => {
            write_token(channel)?;
            read_token(channel, &mut token)?;
        }
    }
    if token != SYNC_TOKEN {
        return Err(BenchError::Setup(format!(
            "unexpected sync token {token:02x?}"
        )));
    }
    debug!("{role}: synchronized with peer");
    Ok(())
}

fn read_token<S: Read>(channel: &mut S, token: &mut [u8]) -> Result<()> {
    channel
        .read_exact(token)
        .map_err(|e| BenchError::oob("sync token", e))
}

fn write_token<S: Write>(channel: &mut S) -> Result<()> {
    channel
        .write_all(&SYNC_TOKEN)
        .and_then(|()| channel.flush())
        .map_err(|e| BenchError::oob("sync token", e))
}
