//! Per-role orchestration: setup on the calling thread, steady state on a
//! pinned worker.

use std::{
    fmt,
    io::{Read, Write},
};

use log::{error, info, warn};

use crate::{
    affinity,
    config::BenchConfig,
    connection::Connection,
    descriptor::ConnectionDescriptor,
    engine::CompletionEngine,
    error::{BenchError, Result},
    exchange,
    stats::Report,
    verbs::VerbsOps,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Log file written by a process running this role
    pub fn log_file_name(self) -> &'static str {
        match self {
            Role::Server => "server.log",
            Role::Client => "client.log",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Everything a role needs besides the verbs provider and the channel.
#[derive(Debug, Clone)]
pub struct BenchParams {
    pub message_size: usize,
    pub concurrency: usize,
    pub config: BenchConfig,
    /// Core for the worker, unpinned when absent
    pub pin_core: Option<usize>,
}

impl BenchParams {
    pub fn validate(&self) -> Result<()> {
        if self.message_size == 0 {
            return Err(BenchError::InvalidInput("message size must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(BenchError::InvalidInput(
                "number of concurrent messages must be positive".into(),
            ));
        }
        if self.config.run.total_ops == 0 {
            return Err(BenchError::InvalidInput(
                "total operations must be positive, the server would never stop".into(),
            ));
        }
        if u32::try_from(self.message_size).is_err() {
            return Err(BenchError::InvalidInput(format!(
                "message size {} exceeds a single scatter/gather entry",
                self.message_size
            )));
        }
        Ok(())
    }
}

fn log_ib_config(local: &ConnectionDescriptor, remote: &ConnectionDescriptor) {
    info!("IB configuration");
    info!("\tlocal  {local}");
    info!("\tremote {remote}");
}

/// Runs one side of the benchmark to completion.
///
/// Setup is sequential on the calling thread: descriptor exchange, queue
/// pair transitions, receive arming, then the sync token. The completion
/// loop runs on a dedicated worker that owns the connection.
pub fn run_role<V, S>(role: Role, params: &BenchParams, verbs: V, channel: &mut S) -> Result<Report>
where
    V: VerbsOps + 'static,
    S: Read + Write,
{
    params.validate()?;
    let mut conn = Connection::new(verbs, params.message_size, params.concurrency)?;
    info!(
        "{role}: using {}, {} slots of {} bytes",
        conn.verbs().device_name(),
        params.concurrency,
        params.message_size
    );

    let local = conn.local_descriptor();
    let remote = exchange::exchange_descriptors(role, channel, &local)?;
    log_ib_config(&local, &remote);

    conn.connect(&remote, params.config.device())?;
    conn.arm_receives()?;
    exchange::synchronize(role, channel)?;
    info!("{role}: connection established");

    let run = params.config.run().clone();
    let pin_core = params.pin_core;
    let worker = std::thread::Builder::new()
        .name(format!("{role}-worker"))
        .spawn(move || -> Result<Report> {
            info!("worker {role} running");
            if let Some(core) = pin_core {
                affinity::pin_current_thread(core)?;
            }
            let result = CompletionEngine::new(&mut conn, role, &run).run();
            conn.teardown();
            info!("worker {role} exited");
            result
        })
        .map_err(|e| BenchError::Setup(format!("failed to spawn worker: {e}")))?;

    let report = worker
        .join()
        .map_err(|_| BenchError::Setup(format!("{role} worker panicked")))?
        .inspect_err(|e| error!("{role}: {e}"))?;

    match report.throughput_mops() {
        Some(mops) => info!("{role}: throughput = {mops:.6} (Mops/s), {report}"),
        None => warn!("{role}: {report}"),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_validated() {
        let mut params = BenchParams {
            message_size: 64,
            concurrency: 4,
            config: BenchConfig::default(),
            pin_core: None,
        };
        assert!(params.validate().is_ok());
        params.concurrency = 0;
        assert!(matches!(params.validate(), Err(BenchError::InvalidInput(_))));
        params.concurrency = 1;
        params.message_size = 0;
        assert!(params.validate().is_err());
        params.message_size = 64;
        params.config.run.total_ops = 0;
        assert!(matches!(params.validate(), Err(BenchError::InvalidInput(_))));
    }

    #[test]
    fn role_names() {
        assert_eq!(Role::Server.log_file_name(), "server.log");
        assert_eq!(Role::Client.to_string(), "client");
    }
}
