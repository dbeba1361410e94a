//! # Client service
//!
//! One spawned task per account. The task owns the socket, the session, the
//! transaction table and every timer; the embedding application talks to it
//! through a command channel and listens on an event channel. Nothing in
//! the engine is shared, so there are no locks and no global state.
//!
//! The loop is a plain select over three sources: the link, the scan timer
//! and the command channel. Link loss tears the connection down and walks
//! the server rotation; handshake rejections and captcha cancellation end
//! the task with a fatal error.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::consts::{cmd, cmd_desc};
use crate::core::crypt;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::command::{Command, UpdateClass};
use crate::protocol::dispatcher::{Action, Dispatcher, Event};
use crate::protocol::login::{self, LoginEffect, LoginEngine, Outgoing};
use crate::protocol::transact::{MatchOutcome, ScanAction, TransactionTracker};
use crate::session::{Captcha, LoginPhase, Session, LOGIN_MODE_HIDDEN};
use crate::transport::connection::{Link, ServerRotation};
use crate::transport::proxy::ProxySettings;
use crate::transport::resolver;

/// Requests from the embedding application.
#[derive(Debug)]
pub enum ClientCommand {
    /// Send a feature command once logged in.
    Send {
        command: Command,
        payload: Vec<u8>,
        class: UpdateClass,
        ship: u32,
        important: bool,
    },
    /// Answer a pending captcha challenge.
    AnswerCaptcha(String),
    /// Give up on a pending captcha challenge; ends the task.
    CancelCaptcha,
    /// Log out cleanly and end the task.
    Logout,
}

/// Notifications to the embedding application.
#[derive(Debug)]
pub enum ClientEvent {
    /// Handshake complete; the bootstrap chain is starting.
    LoggedIn { uid: u32 },
    /// A routed protocol event.
    Protocol(Event),
    /// The server demands a captcha; answer or cancel via the commands.
    CaptchaNeeded(Captcha),
    /// The link went down; the task is walking the server rotation.
    Reconnecting { reason: String },
    /// Clean logout completed.
    LoggedOut,
    /// Unrecoverable failure; the task is ending.
    Fatal { reason: String },
}

/// Handle to a running client task.
pub struct Client {
    commands: mpsc::Sender<ClientCommand>,
    task: JoinHandle<Result<()>>,
}

impl Client {
    /// Validate the configuration and spawn the client task. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        uid: u32,
        password: &str,
    ) -> Result<(Client, mpsc::Receiver<ClientEvent>)> {
        config.validate_strict()?;

        let mut session = Session::new(uid, password);
        if config.network.hidden_login {
            session.login_mode = LOGIN_MODE_HIDDEN;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);

        let retries = config.timing.retries;
        let server_select = config.network.server_select;
        let task = ClientTask {
            config,
            session,
            tracker: TransactionTracker::new(retries),
            dispatcher: Dispatcher::new(),
            engine: LoginEngine::new(server_select),
            events: event_tx,
        };
        let handle = tokio::spawn(task.run(cmd_rx));

        Ok((
            Client {
                commands: cmd_tx,
                task: handle,
            },
            event_rx,
        ))
    }

    pub async fn send(
        &self,
        command: Command,
        payload: Vec<u8>,
        class: UpdateClass,
        ship: u32,
        important: bool,
    ) -> Result<()> {
        self.command(ClientCommand::Send {
            command,
            payload,
            class,
            ship,
            important,
        })
        .await
    }

    pub async fn answer_captcha(&self, code: String) -> Result<()> {
        self.command(ClientCommand::AnswerCaptcha(code)).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.command(ClientCommand::Logout).await
    }

    async fn command(&self, command: ClientCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::Detached)
    }

    /// Wait for the task to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| ProtocolError::ConnectionLost(format!("client task panicked: {e}")))?
    }
}

/// Why the inner link loop returned without an error.
enum LinkExit {
    /// Clean logout; the task ends.
    Logout,
    /// Server redirect; reconnect to this address and restart the handshake.
    Redirect(SocketAddr),
    /// The embedding application dropped its handles; the task ends.
    Detached,
}

/// One step of the link loop, pulled out of the select so the handlers can
/// borrow the task freely.
enum Step {
    Incoming(Result<Packet>),
    Tick,
    Command(Option<ClientCommand>),
}

struct ClientTask {
    config: EngineConfig,
    session: Session,
    tracker: TransactionTracker,
    dispatcher: Dispatcher,
    engine: LoginEngine,
    events: mpsc::Sender<ClientEvent>,
}

impl ClientTask {
    async fn run(mut self, mut commands: mpsc::Receiver<ClientCommand>) -> Result<()> {
        let mut rotation = ServerRotation::new(
            self.config.network.servers.clone(),
            self.config.timing.attempts_per_server,
        );
        let mut redirect: Option<SocketAddr> = None;

        loop {
            let addr = match redirect.take() {
                Some(addr) => addr,
                None => {
                    let host = match rotation.next_attempt() {
                        Ok(host) => host.to_owned(),
                        Err(e) => {
                            self.emit_fatal(&e).await;
                            return Err(e);
                        }
                    };
                    self.session.phase = LoginPhase::Resolving;
                    match resolver::resolve_first(&host, self.config.network.port).await {
                        Ok(addr) => addr,
                        Err(e) => {
                            warn!(host = %host, error = %e, "resolution failed");
                            sleep(self.config.timing.reconnect_interval).await;
                            continue;
                        }
                    }
                }
            };

            self.session.phase = LoginPhase::Connecting;
            let proxy = self.config.proxy.clone();
            let mut link = match self.connect(addr, proxy.as_ref()).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(%addr, error = %e, "connect failed");
                    sleep(self.config.timing.reconnect_interval).await;
                    continue;
                }
            };

            match self.run_link(&mut link, &mut commands).await {
                Ok(LinkExit::Logout) => {
                    self.tracker.clear();
                    self.session.teardown(false);
                    let _ = self.events.send(ClientEvent::LoggedOut).await;
                    return Ok(());
                }
                Ok(LinkExit::Redirect(next)) => {
                    info!(%next, "following server redirect");
                    self.tracker.clear();
                    self.session.teardown(true);
                    redirect = Some(next);
                }
                Ok(LinkExit::Detached) => {
                    debug!("command channel closed, stopping");
                    self.tracker.clear();
                    self.session.teardown(false);
                    return Ok(());
                }
                Err(ProtocolError::Detached) => {
                    debug!("event channel closed, stopping");
                    self.tracker.clear();
                    self.session.teardown(false);
                    return Ok(());
                }
                Err(e) if reconnectable(&e) => {
                    warn!(error = %e, "link lost, reconnecting");
                    self.tracker.clear();
                    self.session.teardown(true);
                    let _ = self
                        .events
                        .send(ClientEvent::Reconnecting {
                            reason: e.to_string(),
                        })
                        .await;
                    sleep(self.config.timing.reconnect_interval).await;
                }
                Err(e) => {
                    self.tracker.clear();
                    self.session.teardown(false);
                    self.emit_fatal(&e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn connect(&self, addr: SocketAddr, proxy: Option<&ProxySettings>) -> Result<Link> {
        Link::connect(addr, self.config.network.use_tcp, proxy).await
    }

    async fn run_link(
        &mut self,
        link: &mut Link,
        commands: &mut mpsc::Receiver<ClientCommand>,
    ) -> Result<LinkExit> {
        let first = self.engine.start(&mut self.session);
        self.send_handshake(link, first).await?;

        let mut ticker = interval(self.config.timing.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it.
        ticker.tick().await;

        loop {
            let step = tokio::select! {
                incoming = link.recv() => Step::Incoming(incoming),
                _ = ticker.tick() => Step::Tick,
                command = commands.recv() => Step::Command(command),
            };

            match step {
                Step::Incoming(Ok(packet)) => {
                    if let Some(exit) = self.on_packet(link, packet).await? {
                        return Ok(exit);
                    }
                }
                Step::Incoming(Err(e)) => return Err(e),
                Step::Tick => self.on_tick(link).await?,
                Step::Command(None) => return Ok(LinkExit::Detached),
                Step::Command(Some(command)) => {
                    if let Some(exit) = self.on_command(link, command).await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn on_packet(&mut self, link: &mut Link, packet: Packet) -> Result<Option<LinkExit>> {
        let (cmd_id, seq) = (packet.cmd, packet.seq);
        match self.tracker.match_reply(cmd_id, seq) {
            MatchOutcome::FirstReply { class, ship } => {
                if is_handshake(cmd_id) {
                    return self.on_handshake_reply(link, cmd_id, &packet.payload).await;
                }
                let body = match crypt::decrypt(&packet.payload, &self.session.keys.session_key) {
                    Ok(body) => Bytes::from(body),
                    Err(e) => {
                        warn!(cmd = cmd_id, desc = cmd_desc(cmd_id), seq, error = %e,
                              "undecryptable reply, dropping");
                        return Ok(None);
                    }
                };
                let actions =
                    self.dispatcher
                        .on_reply(&self.session, class, ship, Command::from(cmd_id), body);
                self.apply_actions(link, actions, None).await?;
            }
            MatchOutcome::Duplicate { replay_ack } => {
                if let Some(wire) = replay_ack {
                    debug!(cmd = cmd_id, seq, "re-acknowledging repeated server packet");
                    link.send_bytes(&wire).await?;
                }
            }
            MatchOutcome::Unmatched => {
                if !self.session.logged_in {
                    debug!(cmd = cmd_id, seq, "queueing server packet until login completes");
                    self.tracker.push_pending(cmd_id, seq, packet.payload);
                    return Ok(None);
                }
                self.dispatch_server(link, cmd_id, seq, packet.payload).await?;
            }
        }
        Ok(None)
    }

    async fn on_handshake_reply(
        &mut self,
        link: &mut Link,
        cmd_id: u16,
        payload: &Bytes,
    ) -> Result<Option<LinkExit>> {
        // The tracker has already consumed this reply, so a handshake packet
        // that fails to decrypt or parse can never be matched again; letting
        // it through would leave the login stalled. It ends the task instead.
        let effects = self.engine.handle_reply(&mut self.session, cmd_id, payload)?;

        for effect in effects {
            match effect {
                LoginEffect::Send(out) => self.send_handshake(link, out).await?,
                LoginEffect::CaptchaNeeded(captcha) => {
                    self.emit(ClientEvent::CaptchaNeeded(captcha)).await?;
                }
                LoginEffect::Redirect(addr) => {
                    return Ok(Some(LinkExit::Redirect(SocketAddr::V4(addr))));
                }
                LoginEffect::Connected => self.on_logged_in(link).await?,
            }
        }
        Ok(None)
    }

    async fn on_logged_in(&mut self, link: &mut Link) -> Result<()> {
        self.emit(ClientEvent::LoggedIn {
            uid: self.session.uid,
        })
        .await?;

        // Server packets that arrived mid-handshake, in arrival order.
        for (cmd_id, seq, payload) in self.tracker.drain_pending() {
            self.dispatch_server(link, cmd_id, seq, payload).await?;
        }

        let first = self.dispatcher.start_bootstrap(&self.session);
        self.send_registered(
            link,
            first.command,
            first.payload,
            first.class,
            0,
            first.important,
        )
        .await
    }

    async fn dispatch_server(
        &mut self,
        link: &mut Link,
        cmd_id: u16,
        seq: u16,
        payload: Bytes,
    ) -> Result<()> {
        let body = match crypt::decrypt(&payload, &self.session.keys.session_key) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(cmd = cmd_id, desc = cmd_desc(cmd_id), seq, error = %e,
                      "undecryptable server packet, dropping");
                return Ok(());
            }
        };
        let command = Command::from(cmd_id);
        let actions = self
            .dispatcher
            .on_server_packet(&mut self.session, command, seq, body);
        if actions.is_empty() {
            return Ok(());
        }
        self.apply_actions(link, actions, Some((cmd_id, seq))).await
    }

    /// Apply routing actions. For a server-initiated origin, a send of the
    /// same command is its acknowledgement: it echoes the server's sequence
    /// number, is never registered as a transaction of our own, and its wire
    /// bytes are cached for replay on server retransmission.
    async fn apply_actions(
        &mut self,
        link: &mut Link,
        actions: Vec<Action>,
        server_origin: Option<(u16, u16)>,
    ) -> Result<()> {
        let mut ack_wire = Vec::new();
        for action in actions {
            match action {
                Action::Send(req) => {
                    if let Some((origin_cmd, origin_seq)) = server_origin {
                        if req.command.id() == origin_cmd {
                            ack_wire = self.send_ack(link, origin_cmd, origin_seq, req.payload).await?;
                            continue;
                        }
                    }
                    self.send_registered(
                        link,
                        req.command,
                        req.payload,
                        req.class,
                        0,
                        req.important,
                    )
                    .await?;
                }
                Action::Emit(event) => self.emit(ClientEvent::Protocol(event)).await?,
            }
        }

        if let Some((origin_cmd, origin_seq)) = server_origin {
            let important = Command::from(origin_cmd) == Command::RecvIm;
            self.tracker
                .observe_server(origin_cmd, origin_seq, important, ack_wire);
        }
        Ok(())
    }

    async fn on_tick(&mut self, link: &mut Link) -> Result<()> {
        for action in self.tracker.scan() {
            match action {
                ScanAction::Resend(wire) => link.send_bytes(&wire).await?,
                ScanAction::Expired {
                    cmd: cmd_id,
                    seq,
                    important,
                } => {
                    if important {
                        return Err(ProtocolError::ConnectionLost(format!(
                            "{} (seq {seq}) went unanswered",
                            cmd_desc(cmd_id)
                        )));
                    }
                    debug!(cmd = cmd_id, seq, "dropping unanswered transaction");
                }
            }
        }

        if self.session.logged_in {
            self.send_registered(
                link,
                Command::KeepAlive,
                login::keep_alive_body(&self.session),
                UpdateClass::None,
                0,
                true,
            )
            .await?;
        }
        Ok(())
    }

    async fn on_command(
        &mut self,
        link: &mut Link,
        command: ClientCommand,
    ) -> Result<Option<LinkExit>> {
        match command {
            ClientCommand::Send {
                command,
                payload,
                class,
                ship,
                important,
            } => {
                if !self.session.logged_in {
                    warn!(cmd = command.id(), "dropping send before login completes");
                    return Ok(None);
                }
                self.send_registered(link, command, payload, class, ship, important)
                    .await?;
            }
            ClientCommand::AnswerCaptcha(code) => {
                // An answer with no pending challenge is an embedder mistake;
                // the connection itself is healthy.
                match self.engine.submit_captcha(&mut self.session, &code) {
                    Ok(out) => self.send_handshake(link, out).await?,
                    Err(e) => warn!(error = %e, "captcha answer ignored"),
                }
            }
            ClientCommand::CancelCaptcha => {
                return Err(self.engine.cancel_captcha(&mut self.session));
            }
            ClientCommand::Logout => {
                self.send_logout(link).await?;
                return Ok(Some(LinkExit::Logout));
            }
        }
        Ok(None)
    }

    /// Handshake payloads are final bytes; register and ship them.
    async fn send_handshake(&mut self, link: &mut Link, out: Outgoing) -> Result<()> {
        let seq = self.session.next_seq();
        let packet = Packet {
            cmd: out.cmd,
            seq,
            uid: self.session.uid,
            payload: Bytes::from(out.payload),
        };
        let wire = link.encode(&packet);
        debug!(cmd = out.cmd, desc = cmd_desc(out.cmd), seq, "sending handshake packet");
        self.tracker
            .register(out.cmd, seq, wire.clone(), out.important, UpdateClass::None, 0);
        link.send_bytes(&wire).await
    }

    /// Post-login sends ride under the session key.
    async fn send_registered(
        &mut self,
        link: &mut Link,
        command: Command,
        payload: Vec<u8>,
        class: UpdateClass,
        ship: u32,
        important: bool,
    ) -> Result<()> {
        let crypted = crypt::encrypt(&payload, &self.session.keys.session_key);
        let seq = self.session.next_seq();
        let packet = Packet {
            cmd: command.id(),
            seq,
            uid: self.session.uid,
            payload: Bytes::from(crypted),
        };
        let wire = link.encode(&packet);
        debug!(cmd = command.id(), desc = cmd_desc(command.id()), seq, "sending");
        self.tracker
            .register(command.id(), seq, wire.clone(), important, class, ship);
        link.send_bytes(&wire).await
    }

    /// Acknowledge a server packet under its own sequence number, without a
    /// transaction of our own. Returns the wire bytes for replay caching.
    async fn send_ack(
        &mut self,
        link: &mut Link,
        cmd_id: u16,
        seq: u16,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let crypted = crypt::encrypt(&payload, &self.session.keys.session_key);
        let packet = Packet {
            cmd: cmd_id,
            seq,
            uid: self.session.uid,
            payload: Bytes::from(crypted),
        };
        let wire = link.encode(&packet);
        link.send_bytes(&wire).await?;
        Ok(wire)
    }

    /// Logout is fire-and-forget: a fixed sequence number, repeated a fixed
    /// number of times, never tracked.
    async fn send_logout(&mut self, link: &mut Link) -> Result<()> {
        let body = login::logout_body(&self.session);
        let crypted = crypt::encrypt(&body, &self.session.keys.session_key);
        let packet = Packet {
            cmd: cmd::LOGOUT,
            seq: login::LOGOUT_SEQ,
            uid: self.session.uid,
            payload: Bytes::from(crypted),
        };
        let wire = link.encode(&packet);
        for _ in 0..login::LOGOUT_REPEAT {
            link.send_bytes(&wire).await?;
        }
        info!(uid = self.session.uid, "logout sent");
        Ok(())
    }

    async fn emit(&self, event: ClientEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ProtocolError::Detached)
    }

    async fn emit_fatal(&self, error: &ProtocolError) {
        let _ = self
            .events
            .send(ClientEvent::Fatal {
                reason: error.to_string(),
            })
            .await;
    }
}

fn is_handshake(cmd_id: u16) -> bool {
    matches!(
        cmd_id,
        cmd::GET_SERVER | cmd::REQUEST_LOGIN_TOKEN | cmd::LOGIN | cmd::CHECK_PWD
    )
}

/// Errors that take the link down but leave the account retryable.
fn reconnectable(error: &ProtocolError) -> bool {
    matches!(
        error,
        ProtocolError::Io(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::ConnectionLost(_)
            | ProtocolError::Proxy(_)
            | ProtocolError::Resolve(_)
    )
}
