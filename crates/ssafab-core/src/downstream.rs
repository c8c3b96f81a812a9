//! Downstream pipeline: one task per service.
//!
//! Owns both listen sockets (SMDB for core/distribution roles, PRDB
//! for the access role) and every accepted child connection. Serves
//! database pulls, forwards update notifications, and runs the
//! prepare/ready handshake that keeps a snapshot swap from landing in
//! the middle of a transfer: while any SMDB connection is mid-phase the
//! pipeline answers a prepare with `update_pending`; the ready goes out
//! only once the last transfer drains.

use std::collections::HashMap;
use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use ssafab_db::SsaDb;
use ssafab_types::{Epoch, Gid, NodeType};
use tracing::{debug, error, info, warn};

use crate::connection::{Conn, ConnRole, ConnState, DbKind, Phase};
use crate::counters::CounterId;
use crate::mailbox::{Inbox, Mailbox};
use crate::msg::{
    AccessMsg, AdminMsg, DbUpdateMsg, DownstreamMsg, ExtractMsg, PortEvent, UpdateSource,
    UpstreamMsg,
};
use crate::rclose::ClosePool;
use crate::server::{self, ServeAction};
use crate::service::ServiceCtx;
use crate::transport;

const SMDB_LISTEN_TOKEN: Token = Token(1);
const PRDB_LISTEN_TOKEN: Token = Token(2);
const FIRST_CONN_TOKEN: usize = 8;

/// Dependencies handed to the downstream thread.
pub struct DownstreamDeps {
    pub access: Option<Mailbox<AccessMsg>>,
    pub admin: Mailbox<AdminMsg>,
    /// Ready replies for extractor-originated prepares (core).
    pub extract: Option<Mailbox<ExtractMsg>>,
    /// Ready replies for upstream-originated prepares (distribution).
    pub upstream: Mailbox<UpstreamMsg>,
    pub rclose: ClosePool,
}

/// The downstream pipeline.
pub struct DownstreamPipeline {
    pub poll: Poll,
    pub inbox: Inbox<DownstreamMsg>,
    pub ctx: Arc<ServiceCtx>,
    pub deps: DownstreamDeps,
}

impl DownstreamPipeline {
    pub fn run(self) {
        Runner::new(self).run();
    }
}

struct Runner {
    poll: Poll,
    inbox: Inbox<DownstreamMsg>,
    ctx: Arc<ServiceCtx>,
    deps: DownstreamDeps,

    smdb_listener: Option<TcpListener>,
    prdb_listener: Option<TcpListener>,
    conns: HashMap<Token, Conn>,
    interests: HashMap<Token, Interest>,
    pending_prdb: HashMap<Token, DbUpdateMsg>,
    next_token: usize,

    smdb: Option<Arc<SsaDb>>,
    epoch: Epoch,
    update_pending: bool,
    update_waiting: bool,
    prepare_source: Option<UpdateSource>,
}

impl Runner {
    fn new(pipeline: DownstreamPipeline) -> Self {
        Self {
            poll: pipeline.poll,
            inbox: pipeline.inbox,
            ctx: pipeline.ctx,
            deps: pipeline.deps,
            smdb_listener: None,
            prdb_listener: None,
            conns: HashMap::new(),
            interests: HashMap::new(),
            pending_prdb: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            smdb: None,
            epoch: Epoch::INVALID,
            update_pending: false,
            update_waiting: false,
            prepare_source: None,
        }
    }

    fn run(mut self) {
        info!(service = %self.ctx.name, "downstream pipeline running");
        let mut events = Events::with_capacity(64);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "downstream poll failed");
                break;
            }

            let tokens: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in tokens {
                match token {
                    SMDB_LISTEN_TOKEN => self.accept_loop(DbKind::Smdb),
                    PRDB_LISTEN_TOKEN => self.accept_loop(DbKind::Prdb),
                    token if self.conns.contains_key(&token) => {
                        if writable {
                            self.conn_writable(token);
                        }
                        if readable {
                            self.conn_readable(token);
                        }
                    }
                    _ => {}
                }
            }

            loop {
                let Some(msg) = self.inbox.try_recv() else {
                    break;
                };
                match msg {
                    DownstreamMsg::Listen => self.start_listen(),
                    DownstreamMsg::PortEvent(event) => self.on_port_event(event),
                    DownstreamMsg::UpdatePrepare(source) => self.on_prepare(source),
                    DownstreamMsg::SmdbUpdate(update) => self.on_smdb_update(update),
                    DownstreamMsg::PrdbUpdate(update) => self.on_prdb_update(update),
                    DownstreamMsg::Disconnect(gid) => self.on_disconnect(gid),
                    DownstreamMsg::Exit => {
                        info!(service = %self.ctx.name, "downstream pipeline exiting");
                        let tokens: Vec<Token> = self.conns.keys().copied().collect();
                        for token in tokens {
                            self.close_conn(token, false);
                        }
                        return;
                    }
                }
            }

            self.rearm_all();
            self.ctx
                .counters
                .set(CounterId::NumChildren, self.conns.len() as u64);
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    fn start_listen(&mut self) {
        if self.ctx.node_type.intersects(NodeType::CORE | NodeType::DISTRIBUTION)
            && self.smdb_listener.is_none()
        {
            match transport::listen(self.ctx.gid, self.ctx.config.net.smdb_port) {
                Ok(mut listener) => {
                    if let Err(e) = self.poll.registry().register(
                        &mut listener,
                        SMDB_LISTEN_TOKEN,
                        Interest::READABLE,
                    ) {
                        error!(error = %e, "SMDB listener registration failed");
                    } else {
                        info!(port = self.ctx.config.net.smdb_port, "SMDB listener up");
                        self.smdb_listener = Some(listener);
                    }
                }
                Err(e) => error!(error = %e, "SMDB listen failed"),
            }
        }
        if self.ctx.node_type.contains(NodeType::ACCESS) && self.prdb_listener.is_none() {
            match transport::listen(self.ctx.gid, self.ctx.config.net.prdb_port) {
                Ok(mut listener) => {
                    if let Err(e) = self.poll.registry().register(
                        &mut listener,
                        PRDB_LISTEN_TOKEN,
                        Interest::READABLE,
                    ) {
                        error!(error = %e, "PRDB listener registration failed");
                    } else {
                        info!(port = self.ctx.config.net.prdb_port, "PRDB listener up");
                        self.prdb_listener = Some(listener);
                    }
                }
                Err(e) => error!(error = %e, "PRDB listen failed"),
            }
        }
    }

    fn on_port_event(&mut self, event: PortEvent) {
        debug!(service = %self.ctx.name, ?event, "port event");
        match event {
            PortEvent::PortActive => self.start_listen(),
            PortEvent::SmChange => {
                if self.ctx.node_type.contains(NodeType::CORE) {
                    self.start_listen();
                }
            }
            PortEvent::PortError => {
                // Children must reconnect once the port recovers.
                let tokens: Vec<Token> = self.conns.keys().copied().collect();
                for token in tokens {
                    self.close_conn(token, true);
                }
            }
        }
    }

    fn accept_loop(&mut self, db_kind: DbKind) {
        loop {
            let listener = match db_kind {
                DbKind::Smdb => self.smdb_listener.as_ref(),
                _ => self.prdb_listener.as_ref(),
            };
            let Some(listener) = listener else {
                return;
            };
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, ?db_kind, "connection accepted");
                    if db_kind == DbKind::Smdb && (self.update_pending || self.update_waiting) {
                        // Mid-handshake: a new transfer could observe
                        // two different snapshots. Refuse; the peer
                        // retries.
                        info!(
                            pending = self.update_pending,
                            waiting = self.update_waiting,
                            "update handshake open; rejecting new SMDB connection"
                        );
                        self.deps.rclose.close(stream);
                        continue;
                    }
                    transport::configure_stream(&stream, self.ctx.config.net.keepalive);

                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let mut conn = Conn::new(stream, token, ConnRole::Downstream, db_kind);
                    conn.state = ConnState::Connected;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut conn.stream, token, Interest::READABLE)
                    {
                        warn!(error = %e, "connection registration failed");
                        self.deps.rclose.close(conn.stream);
                        continue;
                    }
                    self.interests.insert(token, Interest::READABLE);
                    self.conns.insert(token, conn);
                    self.ctx
                        .counters
                        .set_time(CounterId::LastDownstreamConnTime);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Child connections
    // ------------------------------------------------------------------

    fn conn_writable(&mut self, token: Token) {
        let failed = match self.conns.get_mut(&token) {
            Some(conn) => conn.flush().is_err(),
            None => return,
        };
        if failed {
            self.close_conn(token, true);
        }
    }

    fn conn_readable(&mut self, token: Token) {
        let was_identified = self
            .conns
            .get(&token)
            .map(|c| !c.awaiting_preamble())
            .unwrap_or(true);

        let frames = match self.conns.get_mut(&token) {
            Some(conn) => conn.recv_frames(),
            None => return,
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                debug!(error = %e, "child connection lost");
                self.close_conn(token, true);
                return;
            }
        };

        let now_identified = self
            .conns
            .get(&token)
            .map(|c| !c.awaiting_preamble())
            .unwrap_or(true);
        if !was_identified && now_identified {
            self.on_peer_identified(token);
        }

        for frame in frames {
            let action = {
                let smdb = self.smdb.clone();
                let Some(conn) = self.conns.get_mut(&token) else {
                    return;
                };
                server::serve_frame(conn, &frame, smdb.as_ref())
            };
            match action {
                Ok(ServeAction::None) => {}
                Ok(ServeAction::TransferDone) => {
                    debug!("SMDB transfer drained");
                    self.maybe_send_ready();
                }
                Ok(ServeAction::EpochPublished) => {
                    let event = self
                        .conns
                        .get(&token)
                        .map(|c| c.event(self.ctx.index));
                    if let Some(event) = event {
                        if let Some(access) = &self.deps.access {
                            let _ = access.send(AccessMsg::ConnDone(event));
                        }
                        let _ = self.deps.admin.send(AdminMsg::ConnDone(event));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "serving failed; closing child");
                    self.close_conn(token, true);
                    return;
                }
            }
        }

        self.apply_pending_prdb(token);
    }

    /// Runs once the accepting side learns the peer identity from the
    /// preamble: duplicate-peer takeover and arrival notifications.
    fn on_peer_identified(&mut self, token: Token) {
        let Some((gid, db_kind)) = self
            .conns
            .get(&token)
            .map(|c| (c.remote_gid, c.db_kind))
        else {
            return;
        };

        // Implicit take-over on client reconnect: an older connection
        // from the same GID is closed before the new one proceeds.
        let stale: Vec<Token> = self
            .conns
            .iter()
            .filter(|(t, c)| **t != token && c.remote_gid == gid && c.db_kind == db_kind)
            .map(|(t, _)| *t)
            .collect();
        for old in stale {
            warn!(%gid, "removing old connection for reconnecting peer");
            self.close_conn(old, true);
        }

        match db_kind {
            DbKind::Smdb => {
                if let Some(conn) = self.conns.get(&token) {
                    let event = conn.event(self.ctx.index);
                    let _ = self.deps.admin.send(AdminMsg::ConnDone(event));
                }
                if !self.update_pending && !self.update_waiting {
                    if self.smdb.is_some() && self.epoch.is_valid() {
                        let epoch = self.epoch;
                        let failed = self
                            .conns
                            .get_mut(&token)
                            .map(|conn| server::notify_update(conn, epoch).is_err())
                            .unwrap_or(false);
                        if failed {
                            self.close_conn(token, true);
                        }
                    }
                } else {
                    debug!("update handshake open; initial notify deferred");
                }
            }
            // PRDB consumers announce themselves by publishing the
            // epoch buffer; notification is deferred until then.
            DbKind::Prdb => debug!(%gid, "PRDB peer identified"),
            DbKind::None => {}
        }
    }

    fn on_disconnect(&mut self, gid: Gid) {
        let targets: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.remote_gid == gid)
            .map(|(t, _)| *t)
            .collect();
        if targets.is_empty() {
            debug!(%gid, "disconnect request for unknown peer");
        }
        for token in targets {
            info!(%gid, "disconnecting peer by operator request");
            self.close_conn(token, true);
        }
    }

    fn close_conn(&mut self, token: Token, gone: bool) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        self.interests.remove(&token);
        self.pending_prdb.remove(&token);
        let _ = self.poll.registry().deregister(&mut conn.stream);

        let aborted_smdb_transfer = conn.db_kind == DbKind::Smdb && conn.phase != Phase::Idle;
        if gone && !conn.awaiting_preamble() {
            let event = conn.event(self.ctx.index);
            let _ = self.deps.admin.send(AdminMsg::ConnGone(event));
            if conn.db_kind == DbKind::Prdb && conn.epoch_published {
                if let Some(access) = &self.deps.access {
                    let _ = access.send(AccessMsg::ConnGone(event));
                }
            }
        }
        self.deps.rclose.close(conn.stream);

        if aborted_smdb_transfer {
            // The aborted transfer released its reference; a deferred
            // update may be able to proceed now.
            self.maybe_send_ready();
        }
    }

    // ------------------------------------------------------------------
    // Update handshake
    // ------------------------------------------------------------------

    fn xfer_in_progress(&self) -> bool {
        self.conns
            .values()
            .any(|c| c.db_kind == DbKind::Smdb && c.phase != Phase::Idle)
    }

    fn on_prepare(&mut self, source: UpdateSource) {
        if self.update_waiting {
            warn!("prepare received while one is already acknowledged");
        }
        if self.xfer_in_progress() {
            debug!("SMDB transfer in progress; update deferred");
            self.update_pending = true;
            self.prepare_source = Some(source);
        } else {
            self.update_waiting = true;
            self.prepare_source = Some(source);
            self.send_ready(source);
        }
    }

    fn maybe_send_ready(&mut self) {
        if !self.update_pending || self.xfer_in_progress() {
            return;
        }
        self.update_pending = false;
        self.update_waiting = true;
        if let Some(source) = self.prepare_source {
            self.send_ready(source);
        } else {
            warn!("deferred update ready has no source");
        }
    }

    fn send_ready(&self, source: UpdateSource) {
        let sent = match source {
            UpdateSource::Extract => self
                .deps
                .extract
                .as_ref()
                .map(|mb| mb.send(ExtractMsg::UpdateReady))
                .transpose()
                .is_ok(),
            UpdateSource::Upstream => self.deps.upstream.send(UpstreamMsg::UpdateReady).is_ok(),
        };
        if !sent {
            warn!(?source, "update ready delivery failed");
        }
    }

    fn on_smdb_update(&mut self, update: DbUpdateMsg) {
        debug!(epoch = %update.epoch, changed = update.changed, "SMDB update installed");
        self.smdb = Some(update.db);
        self.epoch = update.epoch;
        self.update_waiting = false;
        self.prepare_source = None;

        if !update.changed {
            return;
        }
        let tokens: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.db_kind == DbKind::Smdb && !c.awaiting_preamble())
            .map(|(t, _)| *t)
            .collect();
        for token in tokens {
            let failed = self
                .conns
                .get_mut(&token)
                .map(|conn| server::notify_update(conn, update.epoch).is_err())
                .unwrap_or(false);
            if failed {
                self.close_conn(token, true);
            }
        }
    }

    fn on_prdb_update(&mut self, update: DbUpdateMsg) {
        let Some(target) = update.target else {
            warn!("PRDB update without a target consumer");
            return;
        };
        let token = self
            .conns
            .iter()
            .find(|(_, c)| c.db_kind == DbKind::Prdb && c.remote_gid == target.gid)
            .map(|(t, _)| *t);
        let Some(token) = token else {
            debug!(gid = %target.gid, "PRDB update for disconnected consumer dropped");
            return;
        };

        let phase = self.conns.get(&token).map_or(Phase::Idle, |c| c.phase);
        if phase != Phase::Idle {
            // Mid-transfer: hold the new generation until the pull
            // drains; installing it now would swap under the reader.
            debug!(gid = %target.gid, "consumer mid-pull; PRDB update held");
            self.pending_prdb.insert(token, update);
            return;
        }
        self.install_prdb(token, update);
    }

    fn apply_pending_prdb(&mut self, token: Token) {
        let idle = self
            .conns
            .get(&token)
            .is_some_and(|c| c.phase == Phase::Idle);
        if !idle {
            return;
        }
        if let Some(update) = self.pending_prdb.remove(&token) {
            self.install_prdb(token, update);
        }
    }

    fn install_prdb(&mut self, token: Token, update: DbUpdateMsg) {
        let failed = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            if conn.local_epoch.is_valid() && update.epoch <= conn.local_epoch {
                debug!(
                    epoch = %update.epoch,
                    current = %conn.local_epoch,
                    "stale PRDB generation dropped"
                );
                false
            } else {
                conn.db = Some(update.db);
                conn.local_epoch = update.epoch;
                if conn.epoch_published {
                    server::publish_epoch(conn, update.epoch).is_err()
                } else {
                    false
                }
            }
        };
        if failed {
            self.close_conn(token, true);
        }
    }

    // ------------------------------------------------------------------
    // Poll bookkeeping
    // ------------------------------------------------------------------

    fn rearm_all(&mut self) {
        let updates: Vec<(Token, Interest)> = self
            .conns
            .iter()
            .filter_map(|(token, conn)| {
                let want = conn.interest();
                (self.interests.get(token) != Some(&want)).then_some((*token, want))
            })
            .collect();
        for (token, want) in updates {
            if let Some(conn) = self.conns.get_mut(&token) {
                if self
                    .poll
                    .registry()
                    .reregister(&mut conn.stream, token, want)
                    .is_ok()
                {
                    self.interests.insert(token, want);
                }
            }
        }
    }
}
