//! Per-connection pump: reads PDUs off the wire, drives the session and
//! backend state machines, and writes responses back out.
//!
//! Grounded in the read-side framing used by the client driver (fixed
//! 48-byte BHS, then a length read off the BHS itself, then the padded
//! data segment) and the concurrency model's RX/TX thread pair: one
//! thread parses and dispatches PDUs, a second drains an outbound queue
//! so a slow initiator socket never blocks command processing.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use log::{debug, error, trace, warn};

use crate::backend::{BackendBridge, CommandDirection};
use crate::cmdsn::CmdSnOutcome;
use crate::digest::DigestType as WireDigest;
use crate::erl::{self, FaultPolicy, RecoveryLedger, StatusReplayBuffer};
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{self, opcode, BHS_SIZE, IscsiPdu};
use crate::scsi::{ScsiBlockDevice, SenseData};
use crate::seqbook::{SeqBook, SeqBookParams};
use crate::session::{ConnectionState, DigestType as SessionDigest, IscsiConnection, IscsiSession};
use crate::timers::{TimerAction, TimerRouter, TimerWheel};

fn wire_digest(d: SessionDigest) -> WireDigest {
    match d {
        SessionDigest::None => WireDigest::None,
        SessionDigest::CRC32C => WireDigest::Crc32c,
    }
}

/// Outbound queue depth before the RX thread starts applying backpressure
/// by blocking on send. Bounded per the concurrency model: unbounded
/// queues let one stalled initiator grow memory without limit.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

const NOP_IN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);
const NOP_IN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const DATA_OUT_WATCHDOG: std::time::Duration = std::time::Duration::from_secs(20);

/// The blocking read on the socket is given this timeout so the
/// dispatch loop wakes periodically to drain fired timer actions even
/// when the initiator sends nothing. The timer wheel itself still
/// drives the actual due times; this only bounds how late the
/// connection notices one fired.
const READ_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Everything one connection's worker thread owns. Never shared: the
/// session it belongs to is `Arc<Mutex<_>>` so other connections in the
/// same session (MaxConnections > 1) can reach it for logout/reinstate.
pub struct Connection<D: ScsiBlockDevice> {
    conn: IscsiConnection,
    session: Arc<Mutex<IscsiSession>>,
    backend: Arc<Mutex<BackendBridge<D>>>,
    registry: Arc<crate::registry::Registry>,
    target_name: String,
    target_address: String,
    stream: TcpStream,
    outbound_tx: mpsc::SyncSender<IscsiPdu>,
    outbound_rx: Option<mpsc::Receiver<IscsiPdu>>,
    timers: TimerWheel,
    timer_router: Arc<TimerRouter>,
    timer_rx: Option<mpsc::Receiver<TimerAction>>,
    shutting_down: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    max_connections: usize,
    active_sessions: Arc<AtomicUsize>,
    max_sessions: usize,
    session_counted: bool,
    commands: crate::backend::CommandTable,
    status_replay: StatusReplayBuffer,
    recovery: RecoveryLedger,
}

impl<D: ScsiBlockDevice + 'static> Connection<D> {
    pub fn new(
        cid: u16,
        stream: TcpStream,
        session: Arc<Mutex<IscsiSession>>,
        backend: Arc<Mutex<BackendBridge<D>>>,
        registry: Arc<crate::registry::Registry>,
        target_name: String,
        target_address: String,
        timers: TimerWheel,
        timer_router: Arc<TimerRouter>,
        shutting_down: Arc<AtomicBool>,
        active_connections: Arc<AtomicUsize>,
        max_connections: usize,
        active_sessions: Arc<AtomicUsize>,
        max_sessions: usize,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::sync_channel(OUTBOUND_QUEUE_DEPTH);
        Connection {
            conn: IscsiConnection::new(cid),
            session,
            backend,
            registry,
            target_name,
            target_address,
            stream,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            timers,
            timer_router,
            timer_rx: None,
            shutting_down,
            active_connections,
            max_connections,
            active_sessions,
            max_sessions,
            session_counted: false,
            commands: crate::backend::CommandTable::new(),
            status_replay: StatusReplayBuffer::new(64),
            recovery: RecoveryLedger::new(),
        }
    }

    fn conn_id(&self) -> u64 {
        self.conn.cid as u64
    }

    /// Spawn the TX pump and run the RX/dispatch loop on the caller's
    /// thread until the connection closes or fails. Blocks until the TX
    /// thread has drained and joined.
    pub fn run(mut self) -> ScsiResult<()> {
        let write_half = self.stream.try_clone().map_err(IscsiError::Io)?;
        let outbound_rx = self.outbound_rx.take().expect("outbound_rx taken twice");
        let header_digest = self.session_digest(|p| p.header_digest);
        let data_digest = self.session_digest(|p| p.data_digest);
        let tx_handle = spawn_tx_pump(write_half, outbound_rx, header_digest, data_digest);

        self.timer_rx = Some(self.timer_router.register(self.conn_id()));
        self.stream
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .map_err(IscsiError::Io)?;

        self.conn.state = ConnectionState::InLogin;
        self.timers.schedule(NOP_IN_TIMEOUT, TimerAction::LoginWatchdog { conn_id: self.conn_id() });
        self.active_connections.fetch_add(1, Ordering::SeqCst);

        let result = self.dispatch_loop();

        if self.session_counted {
            self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        self.timers.cancel(TimerAction::LoginWatchdog { conn_id: self.conn_id() });
        self.timers.cancel(TimerAction::NopInPing { conn_id: self.conn_id() });
        self.timers.cancel(TimerAction::NopInTimeout { conn_id: self.conn_id() });
        self.timer_router.unregister(self.conn_id());
        drop(self.outbound_tx);
        tx_handle.join();

        result
    }

    fn session_digest<F: Fn(&crate::session::SessionParams) -> SessionDigest>(&self, f: F) -> WireDigest {
        let session = self.session.lock().expect("session mutex poisoned");
        wire_digest(f(&session.params))
    }

    fn dispatch_loop(&mut self) -> ScsiResult<()> {
        loop {
            self.drain_timer_actions()?;

            let (header_digest, data_digest) = (
                self.session_digest(|p| p.header_digest),
                self.session_digest(|p| p.data_digest),
            );

            let pdu = match read_pdu(&mut self.stream, header_digest, data_digest) {
                Ok(pdu) => pdu,
                Err(IscsiError::Io(e)) if is_read_timeout(&e) => {
                    // Nothing arrived within READ_POLL_INTERVAL; loop
                    // back around to drain any fired timer actions.
                    continue;
                }
                Err(IscsiError::Io(e)) if is_clean_close(&e) => {
                    debug!("connection {} closed by initiator", self.conn.cid);
                    return Ok(());
                }
                Err(e @ (IscsiError::DataDigestError { .. } | IscsiError::HeaderDigestError)) => {
                    let erl = {
                        let session = self.session.lock().expect("session mutex poisoned");
                        session.params.error_recovery_level
                    };
                    match erl::fault_policy(erl) {
                        FaultPolicy::FailSession => return Err(e),
                        FaultPolicy::DropAndAwaitSnack => {
                            warn!("connection {}: dropping digest-corrupt PDU, awaiting SNACK: {e}", self.conn.cid);
                            continue;
                        }
                    }
                }
                Err(e) => return Err(e),
            };

            match self.handle_pdu(pdu) {
                Ok(()) => {}
                Err(e) if e.is_command_level() => {
                    warn!("command-level error on connection {}: {e}", self.conn.cid);
                }
                Err(e) => {
                    error!("connection {} failing: {e}", self.conn.cid);
                    return Err(e);
                }
            }

            if self.conn.state == ConnectionState::Cleanup {
                return Ok(());
            }
        }
    }

    /// Drain every timer action routed to this connection since the
    /// last poll, acting on each. Called once per dispatch loop
    /// iteration so a stalled initiator's idle socket doesn't delay a
    /// NOP-In ping or a watchdog timeout past `READ_POLL_INTERVAL`.
    fn drain_timer_actions(&mut self) -> ScsiResult<()> {
        let mut pending = Vec::new();
        {
            let rx = self.timer_rx.as_ref().expect("timer_rx registered in run()");
            while let Ok(action) = rx.try_recv() {
                pending.push(action);
            }
        }
        for action in pending {
            self.handle_timer_action(action)?;
        }
        Ok(())
    }

    fn handle_timer_action(&mut self, action: TimerAction) -> ScsiResult<()> {
        match action {
            TimerAction::NopInPing { .. } => {
                let response = {
                    let mut session = self.session.lock().expect("session mutex poisoned");
                    IscsiPdu::nop_in(
                        0xFFFF_FFFF,
                        0xFFFF_FFFF,
                        session.next_stat_sn(),
                        session.exp_cmd_sn,
                        session.max_cmd_sn,
                        0,
                    )
                };
                self.send(response)?;
                self.timers.schedule(NOP_IN_TIMEOUT, TimerAction::NopInTimeout { conn_id: self.conn_id() });
                self.timers.schedule(NOP_IN_INTERVAL, TimerAction::NopInPing { conn_id: self.conn_id() });
                Ok(())
            }
            TimerAction::NopInTimeout { .. } => Err(IscsiError::ConnectionLost(format!(
                "connection {} did not answer NOP-In within {NOP_IN_TIMEOUT:?}",
                self.conn.cid
            ))),
            TimerAction::LoginWatchdog { .. } => {
                if self.conn.state == ConnectionState::InLogin {
                    Err(IscsiError::Timeout(format!(
                        "connection {} did not complete login within {NOP_IN_TIMEOUT:?}",
                        self.conn.cid
                    )))
                } else {
                    Ok(())
                }
            }
            TimerAction::DataOutWatchdog { itt, .. } => {
                if self.commands.complete(itt).is_some() {
                    warn!("connection {}: DataOut watchdog expired for itt {itt}, aborting command", self.conn.cid);
                    let response = crate::scsi::ScsiResponse::check_condition(SenseData::new(
                        crate::scsi::sense_key::ABORTED_COMMAND,
                        crate::scsi::asc::NO_ADDITIONAL_SENSE,
                        0,
                    ));
                    self.send_scsi_response(itt, &response)?;
                }
                Ok(())
            }
            TimerAction::Time2Retain { .. } => {
                // Session-scoped; the router never delivers this to a
                // connection (see `TimerAction::conn_id`).
                Ok(())
            }
        }
    }

    fn send(&self, pdu: IscsiPdu) -> ScsiResult<()> {
        self.outbound_tx
            .send(pdu)
            .map_err(|_| IscsiError::ConnectionLost("outbound queue closed".into()))
    }

    fn handle_pdu(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        match pdu.opcode {
            opcode::LOGIN_REQUEST => self.handle_login(pdu),
            opcode::SCSI_COMMAND => self.handle_scsi_command(pdu),
            opcode::SCSI_DATA_OUT => self.handle_data_out(pdu),
            opcode::NOP_OUT => self.handle_nop_out(pdu),
            opcode::LOGOUT_REQUEST => self.handle_logout(pdu),
            opcode::TEXT_REQUEST => self.handle_text(pdu),
            opcode::TASK_MANAGEMENT_REQUEST => self.handle_task_management(pdu),
            opcode::SNACK_REQUEST => self.handle_snack(pdu),
            other => {
                warn!("connection {}: unsupported opcode 0x{other:02x}", self.conn.cid);
                let mut rejected_header = [0u8; BHS_SIZE];
                rejected_header.copy_from_slice(&pdu.to_bytes()[..BHS_SIZE]);
                let reject = {
                    let mut session = self.session.lock().expect("session mutex poisoned");
                    IscsiPdu::reject(
                        session.next_stat_sn(),
                        session.exp_cmd_sn,
                        session.max_cmd_sn,
                        0,
                        pdu::reject_reason::COMMAND_NOT_SUPPORTED,
                        rejected_header,
                    )
                };
                self.send(reject)
            }
        }
    }

    fn handle_login(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            let response = {
                let session = self.session.lock().expect("session mutex poisoned");
                session.create_shutdown_reject(pdu.itt)?
            };
            self.send(response)?;
            self.conn.state = ConnectionState::Cleanup;
            return Ok(());
        }
        if self.active_connections.load(Ordering::SeqCst) > self.max_connections {
            let response = {
                let session = self.session.lock().expect("session mutex poisoned");
                session.create_too_many_connections_reject(pdu.itt)?
            };
            self.send(response)?;
            self.conn.state = ConnectionState::Cleanup;
            return Ok(());
        }
        if !self.session_counted && self.active_sessions.load(Ordering::SeqCst) >= self.max_sessions {
            let response = {
                let session = self.session.lock().expect("session mutex poisoned");
                session.create_out_of_resources_reject(pdu.itt)?
            };
            self.send(response)?;
            self.conn.state = ConnectionState::Cleanup;
            return Ok(());
        }

        let response = {
            let mut session = self.session.lock().expect("session mutex poisoned");
            session.process_login(&pdu, &self.target_name, &self.registry)?
        };
        let full_feature = {
            let session = self.session.lock().expect("session mutex poisoned");
            session.is_full_feature()
        };
        if full_feature {
            self.conn.state = ConnectionState::LoggedIn;
            if !self.session_counted {
                self.active_sessions.fetch_add(1, Ordering::SeqCst);
                self.session_counted = true;
            }
            self.timers.cancel(TimerAction::LoginWatchdog { conn_id: self.conn.cid as u64 });
            self.timers.schedule(NOP_IN_INTERVAL, TimerAction::NopInPing { conn_id: self.conn.cid as u64 });
        }
        self.send(response)
    }

    fn handle_logout(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        let response = {
            let mut session = self.session.lock().expect("session mutex poisoned");
            session.process_logout(&pdu)?
        };
        self.send(response)?;
        self.conn.state = ConnectionState::Cleanup;
        Ok(())
    }

    fn handle_nop_out(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        if pdu.itt == 0xFFFF_FFFF {
            // Unsolicited NOP-Out is a ping reply, nothing to send back.
            self.timers.cancel(TimerAction::NopInTimeout { conn_id: self.conn.cid as u64 });
            return Ok(());
        }
        let response = {
            let mut session = self.session.lock().expect("session mutex poisoned");
            session.process_nop_out(&pdu)?
        };
        self.send(response)
    }

    fn handle_text(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        let text = pdu.parse_text_request()?;
        let mut session = self.session.lock().expect("session mutex poisoned");
        let params = if text.parameters.iter().any(|(k, _)| k == "SendTargets") {
            session.handle_send_targets(&self.target_name, &self.target_address)
        } else {
            Vec::new()
        };
        let data = pdu::serialize_text_parameters(&params);
        let response = IscsiPdu::text_response(
            pdu.itt,
            0xFFFF_FFFF,
            session.next_stat_sn(),
            session.exp_cmd_sn,
            session.max_cmd_sn,
            true,
            data,
        );
        drop(session);
        self.send(response)
    }

    fn handle_task_management(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        let tmf = pdu.parse_task_management_request()?;
        use crate::pdu::tmf_function;
        use crate::pdu::tmf_response;

        let response_code = match tmf.function {
            tmf_function::ABORT_TASK => {
                self.commands.complete(tmf.referenced_task_tag);
                tmf_response::COMPLETE
            }
            tmf_function::ABORT_TASK_SET | tmf_function::CLEAR_TASK_SET => {
                self.commands.clear();
                tmf_response::COMPLETE
            }
            tmf_function::LOGICAL_UNIT_RESET => {
                self.commands.clear();
                tmf_response::COMPLETE
            }
            _ => tmf_response::FUNCTION_REJECTED,
        };

        let mut session = self.session.lock().expect("session mutex poisoned");
        let response = IscsiPdu::task_management_response(
            tmf.itt,
            session.next_stat_sn(),
            session.exp_cmd_sn,
            session.max_cmd_sn,
            response_code,
        );
        drop(session);
        self.send(response)
    }

    fn handle_snack(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        let snack = pdu.parse_snack_request()?;
        let snack_type = erl::classify_snack(snack.snack_type, snack.itt)?;
        use crate::pdu::snack_type;
        match snack_type {
            snack_type::STATUS => {
                let replayed = self.status_replay.status_snack(snack.beg_run, snack.run_length)?;
                for entry in replayed {
                    let pdu = IscsiPdu::from_bytes(&entry.bytes)?;
                    self.send(pdu)?;
                }
                Ok(())
            }
            snack_type::DATA_OR_R2T => {
                let replayed = self.recovery.r2t_snack(snack.beg_run, snack.run_length, snack.itt)?;
                let mut session = self.session.lock().expect("session mutex poisoned");
                for r2t in replayed {
                    let response = IscsiPdu::r2t(
                        snack.itt,
                        snack.ttt,
                        snack.lun,
                        session.next_stat_sn(),
                        session.exp_cmd_sn,
                        session.max_cmd_sn,
                        r2t.r2t_sn,
                        r2t.buffer_offset,
                        r2t.desired_length,
                    );
                    drop(session);
                    self.send(response)?;
                    session = self.session.lock().expect("session mutex poisoned");
                }
                Ok(())
            }
            snack_type::DATA_ACK => {
                self.recovery.data_ack(snack.beg_run);
                Ok(())
            }
            _ => Err(IscsiError::ProtocolError {
                itt: snack.itt,
                detail: "unsupported SNACK type".into(),
            }),
        }
    }

    /// Enforce CmdSN ordering before a SCSI command is allowed to
    /// execute. Non-immediate commands that arrive ahead of ExpCmdSN
    /// are buffered (ERL>=1) or rejected with a PROTOCOL_ERROR reject
    /// (ERL=0); commands below ExpCmdSN are silently dropped, matching
    /// `cmdsn::CmdSnWindow`'s semantics. Returns every PDU now ready to
    /// execute, in CmdSN order (possibly empty, possibly more than one
    /// if draining unblocked buffered commands).
    fn admit_cmd_sn(&mut self, cmd_sn: u32, pdu: IscsiPdu) -> ScsiResult<Vec<IscsiPdu>> {
        let mut session = self.session.lock().expect("session mutex poisoned");
        let (outcome, pdu) = session.submit_cmd_sn(cmd_sn, pdu);
        match outcome {
            CmdSnOutcome::Execute => {
                let mut ready = vec![pdu.expect("Execute carries the pdu back")];
                ready.extend(session.drain_ready_cmd_sn());
                Ok(ready)
            }
            CmdSnOutcome::Higher => Ok(Vec::new()),
            CmdSnOutcome::Lower => {
                trace!("connection {}: dropping CmdSN {cmd_sn} behind ExpCmdSN {}", self.conn.cid, session.exp_cmd_sn);
                Ok(Vec::new())
            }
            CmdSnOutcome::RejectOutOfOrder => {
                let pdu = pdu.expect("RejectOutOfOrder carries the pdu back");
                let mut rejected_header = [0u8; BHS_SIZE];
                rejected_header.copy_from_slice(&pdu.to_bytes()[..BHS_SIZE]);
                let reject = IscsiPdu::reject(
                    session.next_stat_sn(),
                    session.exp_cmd_sn,
                    session.max_cmd_sn,
                    0,
                    pdu::reject_reason::PROTOCOL_ERROR,
                    rejected_header,
                );
                drop(session);
                self.send(reject)?;
                Ok(Vec::new())
            }
        }
    }

    fn handle_scsi_command(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        let cmd_sn = pdu.parse_scsi_command()?.cmd_sn;
        let ready = self.admit_cmd_sn(cmd_sn, pdu)?;
        for ready_pdu in ready {
            self.execute_scsi_command(ready_pdu)?;
        }
        Ok(())
    }

    fn execute_scsi_command(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        let cmd = pdu.parse_scsi_command()?;
        {
            let backend = self.backend.lock().expect("backend mutex poisoned");
            backend.resolve_lun(cmd.lun)?;
        }

        let direction = CommandDirection::from_cmd_pdu(&cmd);
        self.commands.begin(&cmd);

        match direction {
            CommandDirection::Read => self.start_read(&cmd),
            CommandDirection::Write => {
                if !pdu.data.is_empty() {
                    let active = self.commands.get_mut(cmd.itt).expect("just inserted");
                    active.ingest_data_out(0, &pdu.data)?;
                }
                self.drive_write(cmd.itt)
            }
            CommandDirection::NoData => self.execute_and_respond(cmd.itt),
        }
    }

    fn start_read(&mut self, cmd: &pdu::ScsiCommandPdu) -> ScsiResult<()> {
        let response = {
            let mut backend = self.backend.lock().expect("backend mutex poisoned");
            backend.execute(&cmd.cdb, None)?
        };

        if response.status != crate::scsi::scsi_status::GOOD {
            return self.send_scsi_response(cmd.itt, &response);
        }

        let params = self.seqbook_params();
        let mut seqbook = SeqBook::new(response.data.len() as u32, &params);
        let ttt = {
            let mut session = self.session.lock().expect("session mutex poisoned");
            session.next_target_transfer_tag()
        };

        loop {
            let step = seqbook.next_data_in(cmd.itt, &params)?;
            let chunk = response.data[step.offset as usize..(step.offset + step.length) as usize].to_vec();
            let is_final = step.is_final();
            let status = if is_final { Some(response.status) } else { None };

            let mut session = self.session.lock().expect("session mutex poisoned");
            let data_in = IscsiPdu::scsi_data_in(
                cmd.itt,
                ttt,
                if is_final { session.next_stat_sn() } else { 0 },
                session.exp_cmd_sn,
                session.max_cmd_sn,
                step.data_sn,
                step.offset,
                chunk,
                is_final,
                status,
            );
            drop(session);
            self.send(data_in)?;

            if seqbook.is_complete() {
                break;
            }
        }

        self.commands.complete(cmd.itt);
        Ok(())
    }

    fn drive_write(&mut self, itt: u32) -> ScsiResult<()> {
        let (is_complete, remaining, offset) = {
            let active = self.commands.get_mut(itt).expect("command began");
            (active.write_is_complete(), active.expected_data_length.saturating_sub(active.write_data_done()), active.write_data_done())
        };

        if is_complete {
            return self.execute_and_respond(itt);
        }

        let params = self.seqbook_params();
        let active = self.commands.get_mut(itt).expect("command began");
        if active.r2t_gen.is_none() {
            active.r2t_gen = Some(crate::seqbook::R2tGenerator::new(
                active.expected_data_length,
                offset,
            ));
        }
        let r2t_gen = active.r2t_gen.as_mut().expect("just set");
        if let Some((r2t_sn, buffer_offset, desired_length)) =
            r2t_gen.next_r2t(params.max_burst_length, params.max_outstanding_r2t)
        {
            let lun = active.lun;
            active.recovery.record_r2t(crate::erl::StoredR2t { r2t_sn, buffer_offset, desired_length });
            let mut session = self.session.lock().expect("session mutex poisoned");
            let ttt = session.next_target_transfer_tag();
            let response = IscsiPdu::r2t(
                itt,
                ttt,
                lun,
                session.next_stat_sn(),
                session.exp_cmd_sn,
                session.max_cmd_sn,
                r2t_sn,
                buffer_offset,
                desired_length,
            );
            drop(session);
            self.send(response)?;
            self.timers.schedule(DATA_OUT_WATCHDOG, TimerAction::DataOutWatchdog { conn_id: self.conn.cid as u64, itt });
        } else if remaining > 0 {
            trace!("write {itt} waiting on further DataOut; {remaining} bytes outstanding");
        }
        Ok(())
    }

    fn handle_data_out(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        let data_out = pdu.parse_scsi_data_out()?;
        let remaining = {
            let active = self
                .commands
                .get_mut(data_out.itt)
                .ok_or(IscsiError::ProtocolError { itt: data_out.itt, detail: "DataOut for unknown task".into() })?;
            active.ingest_data_out(data_out.buffer_offset, &data_out.data)?
        };
        if let Some(active) = self.commands.get_mut(data_out.itt) {
            if let Some(r2t_gen) = active.r2t_gen.as_mut() {
                if data_out.final_flag {
                    r2t_gen.complete_one();
                    self.timers.cancel(TimerAction::DataOutWatchdog { conn_id: self.conn.cid as u64, itt: data_out.itt });
                }
            }
        }
        if remaining == 0 {
            self.execute_and_respond(data_out.itt)
        } else if data_out.final_flag {
            self.drive_write(data_out.itt)
        } else {
            Ok(())
        }
    }

    fn execute_and_respond(&mut self, itt: u32) -> ScsiResult<()> {
        let active = self.commands.complete(itt);
        let response = match active {
            Some(active) => {
                let mut backend = self.backend.lock().expect("backend mutex poisoned");
                match active.direction {
                    CommandDirection::Write => backend.execute(&active.cdb, Some(active.write_buffer()))?,
                    _ => backend.execute(&active.cdb, None)?,
                }
            }
            None => return Err(IscsiError::ProtocolError { itt, detail: "no active command for response".into() }),
        };
        self.send_scsi_response(itt, &response)
    }

    fn send_scsi_response(&mut self, itt: u32, response: &crate::scsi::ScsiResponse) -> ScsiResult<()> {
        let sense_bytes: Option<Vec<u8>> = response.sense.as_ref().map(SenseData::to_bytes);
        let mut session = self.session.lock().expect("session mutex poisoned");
        let stat_sn = session.next_stat_sn();
        let pdu = IscsiPdu::scsi_response(
            itt,
            stat_sn,
            session.exp_cmd_sn,
            session.max_cmd_sn,
            response.status,
            0,
            0,
            sense_bytes.as_deref(),
        );
        drop(session);
        self.status_replay.push(stat_sn, pdu.to_bytes());
        self.send(pdu)
    }

    fn seqbook_params(&self) -> SeqBookParams {
        let session = self.session.lock().expect("session mutex poisoned");
        SeqBookParams {
            max_recv_data_segment_length: session.params.max_recv_data_segment_length,
            max_burst_length: session.params.max_burst_length,
            error_recovery_level: session.params.error_recovery_level,
            data_sequence_in_order: session.params.data_sequence_in_order,
            data_pdu_in_order: session.params.data_pdu_in_order,
        }
    }
}

fn is_clean_close(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    )
}

/// True for the error `set_read_timeout` produces when no data arrives
/// in time, as opposed to a genuine connection failure.
fn is_read_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

/// Read one full PDU (BHS + optional AHS/digest/data) off `stream`.
fn read_pdu(stream: &mut TcpStream, header_digest: WireDigest, data_digest: WireDigest) -> ScsiResult<IscsiPdu> {
    let mut bhs = [0u8; BHS_SIZE];
    stream.read_exact(&mut bhs).map_err(IscsiError::Io)?;

    let ahs_bytes = (bhs[4] as usize) * 4;
    let data_length = ((bhs[5] as u32) << 16) | ((bhs[6] as u32) << 8) | (bhs[7] as u32);
    let padded_data_len = data_length.div_ceil(4) * 4;

    let header_digest_len = if header_digest.is_enabled() { 4 } else { 0 };
    let data_digest_len = if data_digest.is_enabled() && data_length > 0 { 4 } else { 0 };

    let mut rest = vec![0u8; ahs_bytes + header_digest_len + padded_data_len as usize + data_digest_len];
    if !rest.is_empty() {
        stream.read_exact(&mut rest).map_err(IscsiError::Io)?;
    }

    let mut full = Vec::with_capacity(BHS_SIZE + rest.len());
    full.extend_from_slice(&bhs);
    full.extend_from_slice(&rest);

    IscsiPdu::from_bytes_with_digests(&full, header_digest, data_digest)
}

fn spawn_tx_pump(
    mut stream: TcpStream,
    rx: mpsc::Receiver<IscsiPdu>,
    header_digest: WireDigest,
    data_digest: WireDigest,
) -> TxHandle {
    let join = thread::Builder::new()
        .name("iscsi-conn-tx".into())
        .spawn(move || {
            while let Ok(pdu) = rx.recv() {
                let bytes = pdu.to_bytes_with_digests(header_digest, data_digest);
                if let Err(e) = stream.write_all(&bytes) {
                    warn!("tx pump write failed: {e}");
                    return;
                }
            }
        })
        .expect("failed to spawn connection tx thread");
    TxHandle { join: Some(join) }
}

struct TxHandle {
    join: Option<JoinHandle<()>>,
}

impl TxHandle {
    fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
