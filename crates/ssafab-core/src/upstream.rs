//! Upstream pipeline: one task per service.
//!
//! Owns the join/rejoin machinery, the reconnect timer, the single
//! upstream data connection, and the outgoing MAD traffic. On the core
//! service it additionally runs the tree-manager operations: membership
//! datagrams are dispatched here by the control thread and processed
//! under the member-list lock.
//!
//! Join machine:
//!
//! ```text
//! Idle --port active--> Joining --ack ok--> Orphan
//! Joining --ack err/send fail--> (rejoin backoff, doubled, capped)
//! Orphan --InfoRecord--> HaveParent --connect--> Connecting --ok--> Connected
//! Connected --close/err--> HaveParent (+ reconnect timer)
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};
use rand::Rng;
use ssafab_db::SsaDb;
use ssafab_mad::{Mad, MadAttr, MadMethod, MadPort, MemberRecord, PathRecord, encode_tid};
use ssafab_types::{Epoch, NodeType};
use tracing::{debug, error, info, warn};

use crate::connection::{Conn, ConnRole, ConnState, DbKind, Phase};
use crate::counters::CounterId;
use crate::mailbox::{Inbox, Mailbox};
use crate::msg::{
    AccessMsg, AdminMsg, CtrlMsg, DbQueryStatus, DbUpdateMsg, DownstreamMsg, PortEvent,
    UpdateSource, UpstreamMsg,
};
use crate::puller::{self, PullEvent};
use crate::rclose::ClosePool;
use crate::service::ServiceCtx;
use crate::transport;
use crate::tree::{PathQuery, TreeManager};

const CONN_TOKEN: Token = Token(3);

/// Base MAD retry timeout.
const DEFAULT_UMAD_TIMEOUT: Duration = Duration::from_millis(1000);
/// Cap on the doubled MAD retry timeout.
const MAX_UMAD_TIMEOUT: Duration = Duration::from_millis(120 * 1000);
/// Cap factor on the doubled rejoin backoff.
const MAX_REJOIN_FACTOR: u64 = 120;

/// Join-machine state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SvcState {
    Idle,
    Joining,
    Orphan,
    HaveParent,
    Connecting,
    Connected,
}

/// Dependencies handed to the upstream thread.
pub struct UpstreamDeps {
    pub mad: Arc<dyn MadPort + Send + Sync>,
    /// Present on the core service only.
    pub tree: Option<Arc<TreeManager>>,
    pub ctrl: Mailbox<CtrlMsg>,
    pub access: Option<Mailbox<AccessMsg>>,
    pub downstream: Option<Mailbox<DownstreamMsg>>,
    pub admin: Mailbox<AdminMsg>,
    pub rclose: ClosePool,
}

/// The upstream pipeline.
pub struct UpstreamPipeline {
    pub poll: Poll,
    pub inbox: Inbox<UpstreamMsg>,
    pub ctx: Arc<ServiceCtx>,
    pub deps: UpstreamDeps,
    /// Latest fully pulled database, exposed to the local client
    /// surface.
    pub latest_db: Arc<Mutex<Option<Arc<SsaDb>>>>,
}

impl UpstreamPipeline {
    /// Runs the pipeline until `Exit`.
    pub fn run(self) {
        Runner::new(self).run();
    }
}

struct Runner {
    poll: Poll,
    inbox: Inbox<UpstreamMsg>,
    ctx: Arc<ServiceCtx>,
    deps: UpstreamDeps,
    latest_db: Arc<Mutex<Option<Arc<SsaDb>>>>,

    state: SvcState,
    port_active: bool,
    conn: Option<Conn>,
    conn_registered: bool,
    conn_interest: Option<mio::Interest>,
    primary: Option<PathRecord>,
    primary_type: NodeType,
    umad_timeout: Duration,
    rejoin_secs: u64,
    join_deadline: Option<Instant>,
    reconnect_next: Option<Instant>,
    reconnect_interval: Option<Duration>,
    reconnect_count: u32,
    mad_seq: u64,
    outstanding: usize,
    current_db: Option<Arc<SsaDb>>,
    retired_db: Option<Arc<SsaDb>>,
}

impl Runner {
    fn new(pipeline: UpstreamPipeline) -> Self {
        let rejoin_secs = pipeline.ctx.config.timing.rejoin_timeout;
        Self {
            poll: pipeline.poll,
            inbox: pipeline.inbox,
            ctx: pipeline.ctx,
            deps: pipeline.deps,
            latest_db: pipeline.latest_db,
            state: SvcState::Idle,
            port_active: false,
            conn: None,
            conn_registered: false,
            conn_interest: None,
            primary: None,
            primary_type: NodeType::NONE,
            umad_timeout: DEFAULT_UMAD_TIMEOUT,
            rejoin_secs,
            join_deadline: None,
            reconnect_next: None,
            reconnect_interval: None,
            reconnect_count: 0,
            mad_seq: 0,
            outstanding: 0,
            current_db: None,
            retired_db: None,
        }
    }

    fn run(mut self) {
        info!(service = %self.ctx.name, "upstream pipeline running");
        let mut events = Events::with_capacity(32);

        loop {
            let timeout = [self.join_deadline, self.reconnect_next]
                .into_iter()
                .flatten()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .min();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "upstream poll failed");
                break;
            }

            let mut readable = false;
            let mut writable = false;
            for event in &events {
                if event.token() == CONN_TOKEN {
                    readable |= event.is_readable();
                    writable |= event.is_writable();
                }
            }
            if writable {
                self.on_writable();
            }
            if readable {
                self.on_readable();
            }

            loop {
                let Some(msg) = self.inbox.try_recv() else {
                    break;
                };
                match msg {
                    UpstreamMsg::Mad(mad) => self.on_mad(mad),
                    UpstreamMsg::PortEvent(event) => self.on_port_event(event),
                    UpstreamMsg::Connect => self.on_connect(),
                    UpstreamMsg::UpdateReady => self.on_update_ready(),
                    UpstreamMsg::DbQuery(reply) => {
                        let status = self.on_db_query();
                        let _ = reply.send(status);
                    }
                    UpstreamMsg::Exit => {
                        info!(service = %self.ctx.name, "upstream pipeline exiting");
                        self.drop_conn(true);
                        return;
                    }
                }
            }

            self.service_timers();
            self.rearm_conn();
        }
    }

    // ------------------------------------------------------------------
    // Join machine
    // ------------------------------------------------------------------

    fn join(&mut self, bad_parent: bool) {
        let parent_gid = self
            .primary
            .map_or(ssafab_types::Gid::ZERO, |p| p.dgid);
        let rec = MemberRecord {
            port_gid: self.ctx.gid,
            database_id: self.ctx.db_id,
            node_guid: u128::from(self.ctx.gid) as u64,
            node_type: self.ctx.node_type,
            bad_parent,
            parent_gid,
        };
        // Core nodes address themselves; everyone else goes to the SM.
        let to = if self.ctx.node_type.contains(NodeType::CORE) {
            self.ctx.lid
        } else {
            self.ctx.sm_lid
        };
        self.mad_seq += 1;
        let mad = Mad::request(
            self.ctx.lid,
            to,
            MadMethod::Set,
            encode_tid(self.ctx.index as u16, self.mad_seq),
            MadAttr::Member(rec),
        );
        debug!(service = %self.ctx.name, bad_parent, "sending join");
        self.state = SvcState::Joining;
        if let Err(e) = self.deps.mad.send(mad) {
            error!(error = %e, "join send failed");
            self.state = SvcState::Idle;
        }
    }

    fn schedule_join(&mut self) {
        self.state = SvcState::Idle;
        if !self.port_active {
            // The join is re-sent when the port becomes active.
            return;
        }
        // Nanosecond jitter spreads join storms after SM events.
        let jitter_ns = rand::thread_rng().gen_range(1_000..1_000_000_000u64);
        let delay = Duration::from_secs(self.rejoin_secs) + Duration::from_nanos(jitter_ns);
        self.join_deadline = Some(Instant::now() + delay);
        info!(
            service = %self.ctx.name,
            secs = self.rejoin_secs,
            "rejoin scheduled"
        );
        let max = self
            .ctx
            .config
            .timing
            .rejoin_timeout
            .saturating_mul(MAX_REJOIN_FACTOR)
            .max(1);
        self.rejoin_secs = (self.rejoin_secs * 2).min(max).max(1);
    }

    fn on_port_event(&mut self, event: PortEvent) {
        debug!(service = %self.ctx.name, ?event, "port event");
        match event {
            PortEvent::PortError | PortEvent::SmChange => {
                self.port_active = event != PortEvent::PortError;
                if self.ctx.node_type.contains(NodeType::CORE) {
                    if let Some(tree) = self.deps.tree.clone() {
                        if event == PortEvent::SmChange {
                            tree.clean();
                        }
                    }
                }
                // A consumer already attached below the access layer
                // keeps its connection across SM changes.
                let directly_core =
                    event == PortEvent::PortError || self.primary_type.contains(NodeType::CORE);
                if directly_core && self.conn.is_some() {
                    self.drop_conn(true);
                }
                if self.conn.is_some() && self.ctx.node_type == NodeType::CONSUMER {
                    return;
                }
                self.state = SvcState::Idle;
                if self.port_active {
                    self.umad_timeout = DEFAULT_UMAD_TIMEOUT;
                    self.rejoin_secs = self.ctx.config.timing.rejoin_timeout;
                    self.join(false);
                }
            }
            PortEvent::PortActive => {
                self.port_active = true;
                if self.state == SvcState::Idle {
                    self.umad_timeout = DEFAULT_UMAD_TIMEOUT;
                    self.rejoin_secs = self.ctx.config.timing.rejoin_timeout;
                    self.join(false);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // MAD handling
    // ------------------------------------------------------------------

    fn on_mad(&mut self, mad: Mad) {
        self.ctx.counters.set_time(CounterId::LastSsaMadTime);
        if self.deps.tree.is_some() && self.on_core_mad(&mad) {
            return;
        }
        self.on_client_mad(mad);
    }

    /// Core-side handling: membership requests, SA path service, and
    /// attach completion. Returns true when the datagram was consumed.
    fn on_core_mad(&mut self, mad: &Mad) -> bool {
        let tree = self.deps.tree.clone().expect("core service has a tree");
        if mad.local_status != 0 {
            // A failed core-originated send; nothing tree-side to do
            // beyond logging unless it was a path query.
            if let MadAttr::Path(path) = &mad.attr {
                tree.on_path_record_failure(path.sgid, path.dgid);
                return true;
            }
            return false;
        }

        match (&mad.method, &mad.attr) {
            (MadMethod::Set, MadAttr::Member(rec)) => {
                let outcome = tree.on_join(*rec, mad.from);
                let resp =
                    mad.response(MadMethod::GetResp, outcome.status, MadAttr::Member(*rec));
                if let Err(e) = self.deps.mad.send(resp) {
                    warn!(error = %e, "join response send failed");
                }
                self.send_path_queries(&outcome.path_queries);
                true
            }
            (MadMethod::Delete, MadAttr::Member(rec)) => {
                tree.on_leave(rec.port_gid);
                let resp = mad.response(MadMethod::DeleteResp, 0, MadAttr::Member(*rec));
                if let Err(e) = self.deps.mad.send(resp) {
                    warn!(error = %e, "leave response send failed");
                }
                true
            }
            (MadMethod::Get, MadAttr::Path(query)) => {
                // SA surface: the core is co-located with the SM and
                // answers path queries from its member map.
                let mut path = *query;
                let slid = tree.with_member(path.sgid, |m| m.lid);
                let dlid = tree.with_member(path.dgid, |m| m.lid);
                let status = match (slid, dlid) {
                    (Some(slid), Some(dlid)) => {
                        path.slid = slid;
                        path.dlid = dlid;
                        0
                    }
                    _ => 1,
                };
                let resp = mad.response(MadMethod::GetResp, status, MadAttr::Path(path));
                if let Err(e) = self.deps.mad.send(resp) {
                    warn!(error = %e, "path response send failed");
                }
                true
            }
            (MadMethod::GetResp, MadAttr::Path(path)) => {
                if mad.status != 0 {
                    tree.on_path_record_failure(path.sgid, path.dgid);
                    return true;
                }
                if let Some(assignment) = tree.on_path_record(path) {
                    self.mad_seq += 1;
                    let info = Mad::request(
                        self.ctx.lid,
                        assignment.child_lid,
                        MadMethod::Set,
                        encode_tid(self.ctx.index as u16, self.mad_seq),
                        MadAttr::Info(assignment.info),
                    );
                    if let Err(e) = self.deps.mad.send(info) {
                        warn!(error = %e, "parent install send failed");
                    }
                }
                true
            }
            // Client acks for parent installs are received and
            // discarded; no retry is attempted.
            (MadMethod::GetResp, MadAttr::Info(_)) => true,
            _ => false,
        }
    }

    /// Client-side handling: join acks and parent installation.
    fn on_client_mad(&mut self, mad: Mad) {
        if self.state == SvcState::Idle {
            debug!("idle state; discarding MAD");
            self.umad_timeout = DEFAULT_UMAD_TIMEOUT;
            self.rejoin_secs = self.ctx.config.timing.rejoin_timeout;
            return;
        }

        if mad.local_status != 0 {
            debug!(status = mad.local_status, "MAD send failed locally");
            if self.state != SvcState::Joining {
                return;
            }
            self.umad_timeout = (self.umad_timeout * 2).min(MAX_UMAD_TIMEOUT);
            self.schedule_join();
            return;
        }

        self.umad_timeout = DEFAULT_UMAD_TIMEOUT;
        if self.state == SvcState::Joining {
            if mad.status == 0 {
                debug!(service = %self.ctx.name, "join successful");
                self.state = SvcState::Orphan;
            } else {
                info!(status = mad.status, "join rejected");
                self.schedule_join();
                return;
            }
        }

        let MadAttr::Info(info) = &mad.attr else {
            return;
        };
        if mad.method != MadMethod::Set {
            return;
        }

        // Ack the parent installation.
        let ack = mad.response(MadMethod::GetResp, 0, mad.attr.clone());
        if let Err(e) = self.deps.mad.send(ack) {
            warn!(error = %e, "info ack send failed");
        }

        if self.state == SvcState::Orphan {
            self.state = SvcState::HaveParent;
            self.rejoin_secs = self.ctx.config.timing.rejoin_timeout;
        }

        let changed = self.primary != Some(info.path);
        if changed {
            if self.conn.is_some() {
                self.drop_conn(true);
                self.state = SvcState::HaveParent;
            }
            self.primary = Some(info.path);
            self.primary_type = info.parent_node_type;
            debug!(
                parent = %info.path.dgid,
                parent_type = %self.primary_type,
                "parent installed"
            );
            // The core's own service only bookkeeps its membership; it
            // never opens an upstream link.
            if !self.ctx.node_type.contains(NodeType::CORE) {
                let _ = self.deps.ctrl.send(CtrlMsg::ConnRequest(self.ctx.index));
            }
        } else if self.conn.is_some() && self.state != SvcState::Connecting {
            self.state = SvcState::Connected;
        }
    }

    fn send_path_queries(&mut self, queries: &[PathQuery]) {
        for q in queries {
            self.mad_seq += 1;
            let mad = Mad::request(
                self.ctx.lid,
                self.ctx.sm_lid,
                MadMethod::Get,
                encode_tid(self.ctx.index as u16, self.mad_seq),
                MadAttr::Path(PathRecord::new(
                    q.child_gid,
                    ssafab_types::Lid::default(),
                    q.parent_gid,
                    ssafab_types::Lid::default(),
                )),
            );
            if let Err(e) = self.deps.mad.send(mad) {
                warn!(error = %e, "path query send failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Upstream connection
    // ------------------------------------------------------------------

    fn upstream_port_and_kind(&self) -> (u16, DbKind) {
        // A consumer parented to a pure access node pulls its PRDB;
        // parented higher (core/distribution) it pulls the shared SMDB
        // like any other child.
        if self.ctx.node_type == NodeType::CONSUMER && self.primary_type == NodeType::ACCESS {
            (self.ctx.config.net.prdb_port, DbKind::Prdb)
        } else {
            (self.ctx.config.net.smdb_port, DbKind::Smdb)
        }
    }

    fn on_connect(&mut self) {
        let Some(primary) = self.primary else {
            warn!("connect request without a parent");
            return;
        };
        if let Some(conn) = &self.conn {
            if conn.state != ConnState::Idle {
                debug!("upstream connection state not idle");
            }
            self.drop_conn(false);
        }

        let (port, db_kind) = self.upstream_port_and_kind();
        let stream = match transport::connect(primary.dgid, port, self.ctx.config.net.keepalive) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, parent = %primary.dgid, "upstream connect failed");
                self.schedule_reconnect();
                return;
            }
        };

        let mut conn = Conn::new(stream, CONN_TOKEN, ConnRole::Upstream, db_kind);
        conn.state = ConnState::Connecting;
        conn.remote_gid = primary.dgid;
        conn.remote_lid = primary.dlid;
        conn.remote_node_type = self.primary_type;
        conn.reconnect_count = self.reconnect_count;
        conn.queue_preamble(self.ctx.gid, self.ctx.lid, self.ctx.node_type);
        self.conn = Some(conn);
        self.conn_registered = false;
        self.state = SvcState::Connecting;
        self.rearm_conn();
    }

    fn on_writable(&mut self) {
        enum Outcome {
            None,
            Connected(crate::msg::ConnEvent),
            Failed,
        }

        let outcome = match self.conn.as_mut() {
            None => return,
            Some(conn) if conn.state == ConnState::Connecting => {
                match transport::connect_result(&conn.stream) {
                    Ok(()) => {
                        conn.state = ConnState::Connected;
                        // Push the identification preamble now; the
                        // socket is writable and no further edge will
                        // fire for it.
                        let mut ok = conn.flush().is_ok();
                        if ok && conn.db_kind == DbKind::Prdb {
                            // Map the epoch word for one-sided
                            // publication by the access node.
                            let frame = conn.next_query(ssafab_wire::ReplOp::PublishEpochBuf);
                            if let Err(e) = conn.send_frame(&frame) {
                                warn!(error = %e, "epoch publish send failed");
                                ok = false;
                            }
                        }
                        if ok {
                            info!(parent = %conn.remote_gid, "upstream connected");
                            Outcome::Connected(conn.event(self.ctx.index))
                        } else {
                            Outcome::Failed
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "async connect failed");
                        Outcome::Failed
                    }
                }
            }
            Some(conn) => match conn.flush() {
                Ok(()) => Outcome::None,
                Err(e) => {
                    warn!(error = %e, "upstream send failed");
                    Outcome::Failed
                }
            },
        };

        match outcome {
            Outcome::None => {}
            Outcome::Connected(event) => {
                self.state = SvcState::Connected;
                self.reconnect_count = 0;
                self.ctx.counters.set_time(CounterId::LastUpstreamConnTime);
                let _ = self.deps.admin.send(AdminMsg::ConnDone(event));
            }
            Outcome::Failed => self.reconnect(),
        }
    }

    fn on_readable(&mut self) {
        let frames = match self.conn.as_mut() {
            None => return,
            Some(conn) => conn.recv_frames(),
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                debug!(error = %e, "upstream receive failed");
                self.reconnect();
                return;
            }
        };
        for frame in frames {
            let result = match self.conn.as_mut() {
                None => return,
                Some(conn) => puller::handle_frame(conn, &frame),
            };
            match result {
                Ok(PullEvent::None) => {}
                Ok(PullEvent::UpdateNotice(epoch)) => self.on_update_notice(epoch),
                Ok(PullEvent::Complete(db)) => self.on_pull_complete(db),
                Err(e) => {
                    warn!(error = %e, "replication protocol failure");
                    self.reconnect();
                    return;
                }
            }
        }
    }

    /// New-epoch observation: on an SMDB link this is the update
    /// notification driving the prepare/pull cycle; on a PRDB link it
    /// is the emulated one-sided epoch write, consumed lazily by the
    /// local client's freshness query.
    fn on_update_notice(&mut self, epoch: Epoch) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.epoch_word = epoch;
        debug!(%epoch, kind = ?conn.db_kind, "epoch notice");

        if conn.db_kind != DbKind::Smdb || conn.phase != Phase::Idle {
            return;
        }
        if self.current_db.is_some() {
            if self.outstanding == 0 {
                self.outstanding = self.send_prepare();
                if self.outstanding == 0 {
                    self.retired_db = self.current_db.take();
                    self.start_pull();
                }
            }
        } else {
            self.start_pull();
        }
    }

    fn start_pull(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = puller::start_pull(conn) {
                warn!(error = %e, "pull start failed");
                self.reconnect();
            }
        }
    }

    fn send_prepare(&self) -> usize {
        let mut count = 0;
        if self.ctx.node_type.contains(NodeType::ACCESS) {
            if let Some(access) = &self.deps.access {
                if access
                    .send(AccessMsg::UpdatePrepare {
                        source: UpdateSource::Upstream,
                        service: self.ctx.index,
                    })
                    .is_ok()
                {
                    count += 1;
                }
            }
        }
        if self.ctx.node_type.contains(NodeType::DISTRIBUTION) {
            if let Some(downstream) = &self.deps.downstream {
                if downstream
                    .send(DownstreamMsg::UpdatePrepare(UpdateSource::Upstream))
                    .is_ok()
                {
                    count += 1;
                }
            }
        }
        count
    }

    fn on_update_ready(&mut self) {
        if self.outstanding == 0 {
            warn!("unexpected update ready");
            return;
        }
        self.outstanding -= 1;
        if self.outstanding == 0 {
            self.retired_db = self.current_db.take();
            self.start_pull();
        }
    }

    fn on_pull_complete(&mut self, db: SsaDb) {
        let epoch = db.epoch();
        let kind = self.conn.as_ref().map_or(DbKind::None, |c| c.db_kind);
        info!(service = %self.ctx.name, %epoch, ?kind, "database pull complete");

        let db = Arc::new(db);
        if let Some(conn) = self.conn.as_mut() {
            conn.local_epoch = epoch;
        }
        *self.latest_db.lock().expect("latest db slot") = Some(Arc::clone(&db));
        self.ctx.counters.record_db_update(epoch.as_u64());

        if kind == DbKind::Smdb {
            let update = DbUpdateMsg {
                db: Arc::clone(&db),
                epoch,
                changed: true,
                target: None,
            };
            if self.ctx.node_type.contains(NodeType::ACCESS) {
                if let Some(access) = &self.deps.access {
                    let _ = access.send(AccessMsg::SmdbUpdate {
                        update: update.clone(),
                        service: Some(self.ctx.index),
                    });
                }
            }
            if self.ctx.node_type.contains(NodeType::DISTRIBUTION) {
                if let Some(downstream) = &self.deps.downstream {
                    let _ = downstream.send(DownstreamMsg::SmdbUpdate(update));
                }
            }
        }

        // The generation retired when this pull started may go now;
        // the new snapshot becomes current.
        self.retired_db = None;
        self.current_db = Some(db);
    }

    fn on_db_query(&mut self) -> DbQueryStatus {
        let Some(conn) = self.conn.as_mut() else {
            return DbQueryStatus::NoUpstreamConnection;
        };
        if conn.state != ConnState::Connected {
            return DbQueryStatus::NoUpstreamConnection;
        }
        if conn.local_epoch != conn.epoch_word && conn.epoch_word.is_valid() {
            conn.local_epoch = conn.epoch_word;
            if conn.phase == Phase::Idle {
                self.retired_db = self.current_db.take();
                self.start_pull();
            }
            DbQueryStatus::EpochChanged
        } else {
            DbQueryStatus::EpochNotChanged
        }
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    fn reconnect(&mut self) {
        self.drop_conn(true);
        self.state = SvcState::HaveParent;
        self.outstanding = 0;

        // Mid-reconnection: the timer is already pacing attempts.
        if self.reconnect_count > 0 {
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.port_active {
            warn!("upstream connection lost; port inactive");
            return;
        }
        let timeout = self.ctx.config.timing.reconnect_timeout;
        // First attempt lands at a uniformly random point in
        // [0, 2 x timeout) to spread thundering reconnects.
        let first_secs = if timeout > 0 {
            rand::thread_rng().gen_range(0..(2 * timeout))
        } else {
            0
        };
        let first = if first_secs > 0 {
            Duration::from_secs(first_secs)
        } else {
            Duration::from_millis(1)
        };
        self.reconnect_next = Some(Instant::now() + first);
        self.reconnect_interval = (self.ctx.config.timing.reconnect_max_count > 1)
            .then(|| Duration::from_secs(timeout.max(1)));
        info!(
            first_secs,
            interval_secs = timeout,
            "reconnect timer armed"
        );
    }

    fn stop_reconnection(&mut self) {
        self.reconnect_next = None;
        self.reconnect_interval = None;
        self.reconnect_count = 0;
    }

    fn service_timers(&mut self) {
        let now = Instant::now();

        if self.reconnect_next.is_some_and(|t| t <= now) {
            self.reconnect_next = self.reconnect_interval.map(|i| now + i);
            if !self.port_active {
                self.stop_reconnection();
                info!("port inactive; reconnection stopped");
            } else {
                match self.conn.as_ref().map(|c| c.state) {
                    Some(ConnState::Connected) => {
                        self.stop_reconnection();
                        debug!("upstream connected; reconnection stopped");
                    }
                    Some(ConnState::Connecting) => {
                        debug!("upstream connection still being established");
                    }
                    _ => {
                        if self.state == SvcState::HaveParent {
                            self.reconnect_count += 1;
                            let max = self.ctx.config.timing.reconnect_max_count;
                            if self.reconnect_count <= max {
                                info!(
                                    attempt = self.reconnect_count,
                                    max, "reconnection attempt"
                                );
                                let _ = self.deps.ctrl.send(CtrlMsg::ConnRequest(self.ctx.index));
                            } else {
                                info!("reconnection exhausted; rejoining with bad parent");
                                self.drop_conn(true);
                                self.stop_reconnection();
                                self.state = SvcState::Idle;
                                self.join(true);
                            }
                        }
                    }
                }
            }
        }

        if self.join_deadline.is_some_and(|t| t <= now) {
            self.join_deadline = None;
            if !self.port_active {
                debug!("port inactive; rejoin skipped");
            } else if self.state != SvcState::Idle {
                debug!(state = ?self.state, "service not idle; rejoin skipped");
            } else {
                self.join(false);
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection plumbing
    // ------------------------------------------------------------------

    fn drop_conn(&mut self, gone: bool) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if self.conn_registered {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.conn_registered = false;
        }
        self.conn_interest = None;
        if gone && conn.state == ConnState::Connected {
            let _ = self.deps.admin.send(AdminMsg::ConnGone(conn.event(self.ctx.index)));
        }
        self.deps.rclose.close(conn.stream);
    }

    /// Registers or re-registers the connection with its current
    /// interest set.
    fn rearm_conn(&mut self) {
        let registered = self.conn_registered;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let interest = conn.interest();
        if registered {
            if self.conn_interest != Some(interest) {
                if self
                    .poll
                    .registry()
                    .reregister(&mut conn.stream, CONN_TOKEN, interest)
                    .is_ok()
                {
                    self.conn_interest = Some(interest);
                }
            }
        } else if self
            .poll
            .registry()
            .register(&mut conn.stream, CONN_TOKEN, interest)
            .is_ok()
        {
            self.conn_registered = true;
            self.conn_interest = Some(interest);
        }
    }
}
