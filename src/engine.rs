//! Completion-driven steady-state loop.

use std::time::Instant;

use log::{debug, info, trace};

use crate::{
    bench::Role,
    config::RunConfig,
    connection::Connection,
    error::{BenchError, Result},
    stats::{Report, WarmupTimer},
    submit::{CompletionRecord, OpKind, WorkTag},
    verbs::{VerbsOps, WorkCompletion},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Receives armed, waiting for the START message
    AwaitingStart,
    /// Counting, echoing and reposting every receive
    SteadyState,
    /// STOP seen or sent, no more echoes
    Draining,
}

/// Polls the completion queue of one connection and reacts to every
/// completion until the STOP message ends the run.
///
/// The client waits for START, pre-posts `concurrency` REGULAR sends and
/// echoes every message until STOP arrives. The server sends START, echoes
/// every message and sends STOP once `total_ops` messages were received.
/// Any failed completion aborts the loop.
pub struct CompletionEngine<'a, V: VerbsOps> {
    conn: &'a mut Connection<V>,
    role: Role,
    state: EngineState,
    ops: u64,
    total_ops: u64,
    timer: WarmupTimer,
    wc: Vec<WorkCompletion>,
    stop_in_flight: bool,
    report: Option<Report>,
}

impl<'a, V: VerbsOps> CompletionEngine<'a, V> {
    pub fn new(conn: &'a mut Connection<V>, role: Role, run: &RunConfig) -> Self {
        Self {
            conn,
            role,
            state: EngineState::AwaitingStart,
            ops: 0,
            total_ops: run.total_ops,
            timer: WarmupTimer::new(run.warmup_ops),
            wc: vec![WorkCompletion::default(); run.poll_batch.max(1)],
            stop_in_flight: false,
            report: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn ops(&self) -> u64 {
        self.ops
    }

    pub fn report(&self) -> Option<Report> {
        self.report
    }

    /// The run is over once STOP was handled and, on the server, the STOP
    /// send has completed.
    pub fn is_finished(&self) -> bool {
        self.state == EngineState::Draining && !self.stop_in_flight
    }

    /// Kicks off the run. The server sends START and goes straight to
    /// steady state; the client keeps waiting for START.
    pub fn start(&mut self) -> Result<()> {
        if self.role == Role::Server {
            self.conn.post_send(WorkTag::Start)?;
            info!("{}: start signal sent", self.role);
            self.enter_steady_state();
        }
        Ok(())
    }

    /// Polls once without blocking and handles the batch, dropping whatever
    /// follows the completion that ended the run.
    pub fn step(&mut self) -> Result<usize> {
        let n = self.conn.verbs.poll_cq(&mut self.wc)?;
        for i in 0..n {
            if self.is_finished() {
                break;
            }
            let wc = self.wc[i];
            self.handle(&wc)?;
        }
        Ok(n)
    }

    /// Busy-polls until the run is over.
    pub fn run(mut self) -> Result<Report> {
        self.start()?;
        info!("{}: polling in {:?}", self.role, self.state);
        while !self.is_finished() {
            if self.step()? == 0 {
                std::hint::spin_loop();
            }
        }
        self.report
            .ok_or_else(|| BenchError::InvalidInput("run ended without a report".into()))
    }

    fn handle(&mut self, wc: &WorkCompletion) -> Result<()> {
        let record = self.conn.complete(wc)?;
        match (record.kind, self.state) {
            (OpKind::Send, _) => {
                if self.stop_in_flight && record.tag == Some(WorkTag::Stop) {
                    self.stop_in_flight = false;
                    debug!("{}: stop signal delivered", self.role);
                }
            }
            (OpKind::Recv, EngineState::AwaitingStart) => self.on_awaiting_start(&record)?,
            (OpKind::Recv, EngineState::SteadyState) => self.on_steady_state(&record)?,
            (OpKind::Recv, EngineState::Draining) => {
                trace!("{}: ignoring receive in slot {}", self.role, record.slot);
            }
        }
        Ok(())
    }

    fn on_awaiting_start(&mut self, record: &CompletionRecord) -> Result<()> {
        self.conn.post_receive()?;
        if record.tag != Some(WorkTag::Start) {
            return Ok(());
        }
        self.enter_steady_state();
        for _ in 0..self.conn.concurrency() {
            self.conn.post_send(WorkTag::Regular)?;
        }
        info!(
            "{}: ready to send, {} messages in flight",
            self.role,
            self.conn.concurrency()
        );
        Ok(())
    }

    fn on_steady_state(&mut self, record: &CompletionRecord) -> Result<()> {
        self.ops += 1;
        if self.ops == self.timer.threshold() {
            self.timer.observe(self.ops, Instant::now());
            debug!("{}: warm-up done after {} ops", self.role, self.ops);
        }

        match self.role {
            Role::Client if record.tag == Some(WorkTag::Stop) => {
                self.finish();
                return Ok(());
            }
            Role::Server if self.total_ops > 0 && self.ops >= self.total_ops => {
                self.conn.post_send(WorkTag::Stop)?;
                self.stop_in_flight = true;
                self.finish();
                return Ok(());
            }
            Role::Client | Role::Server => {}
        }

        self.conn.post_send_from(record.slot, WorkTag::Regular)?;
        self.conn.post_receive()?;
        Ok(())
    }

    fn enter_steady_state(&mut self) {
        self.state = EngineState::SteadyState;
        self.timer.begin(Instant::now());
    }

    fn finish(&mut self) {
        let report = self.timer.finish(self.ops, Instant::now());
        info!("{}: stopping after {} ops", self.role, self.ops);
        self.state = EngineState::Draining;
        self.report = Some(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::test_util::connected_pair,
        verbs::{mock::MockStats, WcStatus},
    };

    fn run_config(warmup_ops: u64, total_ops: u64, poll_batch: usize) -> RunConfig {
        RunConfig {
            warmup_ops,
            total_ops,
            poll_batch,
            core: 0,
        }
    }

    fn server_recv_count(conn: &mut Connection<crate::verbs::mock::MockVerbs>) -> usize {
        let mut wc = vec![WorkCompletion::default(); 64];
        let n = conn.verbs.poll_cq(&mut wc).unwrap();
        wc[..n]
            .iter()
            .map(|c| conn.complete(c).unwrap())
            .filter(|r| r.kind == OpKind::Recv)
            .count()
    }

    #[test]
    fn start_moves_client_to_steady_state() {
        let (mut client, mut server) = connected_pair(64, 4);
        let run = run_config(0, 0, 20);
        let mut engine = CompletionEngine::new(&mut client.conn, Role::Client, &run);
        engine.start().unwrap();
        assert_eq!(engine.step().unwrap(), 0);
        assert_eq!(engine.state(), EngineState::AwaitingStart);

        server.conn.post_send(WorkTag::Start).unwrap();
        assert_eq!(engine.step().unwrap(), 1);
        assert_eq!(engine.state(), EngineState::SteadyState);
        assert_eq!(engine.ops(), 0);

        let stats = client.ctl.stats();
        assert_eq!(stats.posted_sends, 4);
        assert_eq!(stats.posted_recvs, 5);

        // The server sees exactly the pre-posted sends and nothing more.
        assert_eq!(server_recv_count(&mut server.conn), 4);
        assert_eq!(server_recv_count(&mut server.conn), 0);
    }

    #[test]
    fn regular_message_before_start_is_only_reposted() {
        let (mut client, mut server) = connected_pair(64, 2);
        let run = run_config(0, 0, 20);
        let mut engine = CompletionEngine::new(&mut client.conn, Role::Client, &run);
        server.conn.post_send(WorkTag::Regular).unwrap();
        assert_eq!(engine.step().unwrap(), 1);
        assert_eq!(engine.state(), EngineState::AwaitingStart);
        let stats = client.ctl.stats();
        assert_eq!(stats.posted_sends, 0);
        assert_eq!(stats.posted_recvs, 3);
    }

    #[test]
    fn each_receive_is_echoed_and_reposted_once() {
        let (mut client, mut server) = connected_pair(64, 4);
        let run = run_config(0, 0, 1);
        let mut engine = CompletionEngine::new(&mut client.conn, Role::Client, &run);
        server.conn.post_send(WorkTag::Start).unwrap();
        while engine.state() != EngineState::SteadyState {
            engine.step().unwrap();
        }
        server_recv_count(&mut server.conn);
        for slot in 0..3 {
            server.conn.post_send_from(slot, WorkTag::Regular).unwrap();
        }

        let mut last: MockStats = client.ctl.stats();
        let mut last_ops = engine.ops();
        for _ in 0..32 {
            engine.step().unwrap();
            let stats = client.ctl.stats();
            let sends = stats.posted_sends - last.posted_sends;
            let recvs = stats.posted_recvs - last.posted_recvs;
            if engine.ops() > last_ops {
                assert_eq!(engine.ops() - last_ops, 1);
                assert_eq!((sends, recvs), (1, 1));
            } else {
                assert_eq!((sends, recvs), (0, 0));
            }
            last = stats;
            last_ops = engine.ops();
        }
        assert_eq!(engine.ops(), 3);
    }

    #[test]
    fn start_arriving_mid_batch_keeps_the_rest_of_the_batch() {
        let (mut client, mut server) = connected_pair(64, 4);
        let run = run_config(0, 0, 20);
        let mut engine = CompletionEngine::new(&mut client.conn, Role::Client, &run);
        server.conn.post_send(WorkTag::Start).unwrap();
        server.conn.post_send(WorkTag::Regular).unwrap();
        assert_eq!(engine.step().unwrap(), 2);
        assert_eq!(engine.state(), EngineState::SteadyState);
        assert_eq!(engine.ops(), 1);
    }

    fn drive(
        client: &mut CompletionEngine<'_, crate::verbs::mock::MockVerbs>,
        server: &mut CompletionEngine<'_, crate::verbs::mock::MockVerbs>,
    ) -> Result<()> {
        server.start()?;
        client.start()?;
        for _ in 0..1_000_000 {
            if client.is_finished() && server.is_finished() {
                return Ok(());
            }
            if !client.is_finished() {
                client.step()?;
            }
            if !server.is_finished() {
                server.step()?;
            }
        }
        panic!("echo run did not finish");
    }

    #[test]
    fn full_echo_run_counts_every_message() {
        let (mut client, mut server) = connected_pair(64, 4);
        let run = run_config(10, 200, 20);
        let mut c = CompletionEngine::new(&mut client.conn, Role::Client, &run);
        let mut s = CompletionEngine::new(&mut server.conn, Role::Server, &run);
        drive(&mut c, &mut s).unwrap();

        let (cr, sr) = (c.report().unwrap(), s.report().unwrap());
        assert_eq!(sr.total_ops, 200);
        assert_eq!(cr.total_ops, 200);
        assert_eq!(cr.warmup_ops, 10);
        for report in [cr, sr] {
            let micros = report.elapsed.unwrap().as_secs_f64() * 1e6;
            let mops = report.throughput_mops().unwrap();
            assert!((mops - 200.0 / micros).abs() <= 1e-9 * mops.max(1.0));
        }
        assert_eq!(c.state(), EngineState::Draining);
    }

    #[test]
    fn stop_before_warmup_yields_no_throughput() {
        let (mut client, mut server) = connected_pair(32, 2);
        let run = run_config(1_000, 20, 20);
        let mut c = CompletionEngine::new(&mut client.conn, Role::Client, &run);
        let mut s = CompletionEngine::new(&mut server.conn, Role::Server, &run);
        drive(&mut c, &mut s).unwrap();
        assert_eq!(c.report().unwrap().throughput_mops(), None);
    }

    #[test]
    fn failed_completion_aborts_without_further_posts() {
        let (mut client, mut server) = connected_pair(64, 4);
        client.ctl.inject_failure(
            12,
            WcStatus::Failed {
                code: 10,
                reason: "remote access error",
            },
        );
        let run = run_config(0, 10_000, 1);
        let mut c = CompletionEngine::new(&mut client.conn, Role::Client, &run);
        let mut s = CompletionEngine::new(&mut server.conn, Role::Server, &run);
        s.start().unwrap();

        let err = loop {
            let before = client.ctl.stats();
            match c.step() {
                Ok(_) => {}
                Err(e) => {
                    let after = client.ctl.stats();
                    assert_eq!(after.posted_sends, before.posted_sends);
                    assert_eq!(after.posted_recvs, before.posted_recvs);
                    assert_eq!(after.completions, 13);
                    break e;
                }
            }
            s.step().unwrap();
        };
        assert!(matches!(err, BenchError::Completion { .. }));
        assert!(!c.is_finished());
    }
}
