//! Supervisor: node bring-up, the control thread, and shutdown.
//!
//! The control thread owns the MAD ports: it receives datagrams,
//! correlates responses to services by the index embedded in the
//! transaction id, routes requests by database id, and fans port
//! events out to the pipelines. Upstream connect requests also pass
//! through it, mirroring the original control-plane indirection.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use mio::{Events, Poll, Token, Waker};
use ssafab_config::FabricConfig;
use ssafab_db::{PrdbComputer, SsaDb};
use ssafab_mad::{Mad, MadAttr, MadMethod, MadPort, tid_service_index};
use ssafab_types::{DbId, Gid, Lid, NodeType};
use tracing::{debug, error, info, warn};

use crate::access::{AccessPipeline, worker_count};
use crate::admin::AdminPipeline;
use crate::counters::Counters;
use crate::downstream::{DownstreamDeps, DownstreamPipeline};
use crate::extract::ExtractPipeline;
use crate::mailbox::{Inbox, Mailbox, mailbox};
use crate::msg::{
    AccessMsg, AdminMsg, CtrlMsg, DbQueryStatus, DownstreamMsg, ExtractMsg, PortEvent, UpstreamMsg,
};
use crate::rclose::ClosePoolRunner;
use crate::service::ServiceCtx;
use crate::tree::TreeManager;
use crate::upstream::{UpstreamDeps, UpstreamPipeline};
use crate::{CoreError, CoreResult};

const WAKER_TOKEN: Token = Token(0);
const MAD_TOKEN: Token = Token(7);

/// One discovered port.
#[derive(Debug, Clone, Copy)]
pub struct PortDesc {
    pub gid: Gid,
    pub lid: Lid,
    pub sm_lid: Lid,
    pub sm_sl: u8,
}

/// Source of subnet-state snapshots (the subnet manager's view). The
/// routing engine behind it is outside this workspace.
pub trait SubnetProvider: Send + Sync {
    /// Snapshots the current subnet state under the SM read lock.
    /// Epochs are stamped by the extractor, not the provider.
    fn snapshot(&self) -> SsaDb;
}

/// Node bring-up entry point.
pub struct Node;

/// Handle to a running node.
pub struct NodeHandle {
    pub counters: Arc<Counters>,
    pub tree: Option<Arc<TreeManager>>,
    ctrl: Mailbox<CtrlMsg>,
    upstream: Vec<Mailbox<UpstreamMsg>>,
    downstream: Vec<Option<Mailbox<DownstreamMsg>>>,
    extract: Option<Mailbox<ExtractMsg>>,
    access: Option<Mailbox<AccessMsg>>,
    admin: Mailbox<AdminMsg>,
    latest_dbs: Vec<Arc<Mutex<Option<Arc<SsaDb>>>>>,
    handles: Vec<JoinHandle<()>>,
    rclose: Option<ClosePoolRunner>,
}

struct SvcParts {
    ctx: Arc<ServiceCtx>,
    mad: Arc<dyn MadPort + Send + Sync>,
    up_poll: Poll,
    up_mb: Mailbox<UpstreamMsg>,
    up_inbox: Inbox<UpstreamMsg>,
    down: Option<(Poll, Mailbox<DownstreamMsg>, Inbox<DownstreamMsg>)>,
    latest_db: Arc<Mutex<Option<Arc<SsaDb>>>>,
}

impl Node {
    /// Brings up a node: one service per active port plus the singleton
    /// pipelines the node's roles require.
    ///
    /// `provider` is required for core nodes, `computer` for nodes
    /// carrying the access role.
    pub fn start(
        config: Arc<FabricConfig>,
        node_type: NodeType,
        ports: Vec<(PortDesc, Arc<dyn MadPort + Send + Sync>)>,
        provider: Option<Arc<dyn SubnetProvider>>,
        computer: Option<Arc<dyn PrdbComputer>>,
    ) -> CoreResult<NodeHandle> {
        if ports.is_empty() {
            return Err(CoreError::Init("no active ports".into()));
        }
        let is_core = node_type.contains(NodeType::CORE);
        let is_access = node_type.contains(NodeType::ACCESS);
        let provider = match (is_core, provider) {
            (true, Some(p)) => Some(p),
            (true, None) => {
                return Err(CoreError::Init("core node requires a subnet provider".into()));
            }
            (false, _) => None,
        };
        let computer = match (is_access, computer) {
            (true, Some(c)) => Some(c),
            (true, None) => {
                return Err(CoreError::Init("access node requires a PRDB computer".into()));
            }
            (false, _) => None,
        };

        let counters = Arc::new(Counters::new());
        let rclose_runner = ClosePoolRunner::start();
        let rclose = rclose_runner.pool.clone();
        let local = ports[0].0;

        let tree = is_core.then(|| {
            Arc::new(TreeManager::new(
                local.gid,
                Duration::from_secs(config.timing.join_timeout),
            ))
        });

        // Phase 1: polls and mailboxes for every pipeline, so the whole
        // dependency graph is wired before anything runs.
        let ctrl_poll = Poll::new()?;
        let (ctrl_mb, ctrl_inbox) = mailbox(ctrl_poll.registry(), WAKER_TOKEN)?;
        let mad_waker = Arc::new(Waker::new(ctrl_poll.registry(), MAD_TOKEN)?);

        let admin_poll = Poll::new()?;
        let (admin_mb, admin_inbox) = mailbox(admin_poll.registry(), WAKER_TOKEN)?;

        let extract_parts = if is_core {
            let poll = Poll::new()?;
            let (mb, inbox) = mailbox(poll.registry(), WAKER_TOKEN)?;
            Some((poll, mb, inbox))
        } else {
            None
        };
        let extract_mb = extract_parts.as_ref().map(|(_, mb, _)| mb.clone());

        let access_parts = if is_access {
            let poll = Poll::new()?;
            let (mb, inbox) = mailbox(poll.registry(), WAKER_TOKEN)?;
            Some((poll, mb, inbox))
        } else {
            None
        };
        let access_mb = access_parts.as_ref().map(|(_, mb, _)| mb.clone());

        let mut parts = Vec::new();
        for (index, (port, mad)) in ports.into_iter().enumerate() {
            let ctx = ServiceCtx::new(
                index,
                node_type,
                DbId::PATH_DATA,
                port.gid,
                port.lid,
                port.sm_lid,
                port.sm_sl,
                Arc::clone(&config),
                Arc::clone(&counters),
            );
            let up_poll = Poll::new()?;
            let (up_mb, up_inbox) = mailbox(up_poll.registry(), WAKER_TOKEN)?;
            let down = if node_type == NodeType::CONSUMER {
                None
            } else {
                let poll = Poll::new()?;
                let (mb, inbox) = mailbox(poll.registry(), WAKER_TOKEN)?;
                Some((poll, mb, inbox))
            };
            parts.push(SvcParts {
                ctx,
                mad,
                up_poll,
                up_mb,
                up_inbox,
                down,
                latest_db: Arc::new(Mutex::new(None)),
            });
        }

        let downstream_mbs: Vec<Option<Mailbox<DownstreamMsg>>> = parts
            .iter()
            .map(|p| p.down.as_ref().map(|(_, mb, _)| mb.clone()))
            .collect();
        let upstream_mbs: Vec<Mailbox<UpstreamMsg>> =
            parts.iter().map(|p| p.up_mb.clone()).collect();
        let latest_dbs: Vec<Arc<Mutex<Option<Arc<SsaDb>>>>> =
            parts.iter().map(|p| Arc::clone(&p.latest_db)).collect();
        let mads: Vec<Arc<dyn MadPort + Send + Sync>> =
            parts.iter().map(|p| Arc::clone(&p.mad)).collect();
        let svc_db_ids: Vec<DbId> = parts.iter().map(|p| p.ctx.db_id).collect();

        // Phase 2: spawn everything.
        let mut handles = Vec::new();

        for svc in parts {
            let name = svc.ctx.name.clone();
            let downstream_mb = svc.down.as_ref().map(|(_, mb, _)| mb.clone());

            let upstream = UpstreamPipeline {
                poll: svc.up_poll,
                inbox: svc.up_inbox,
                ctx: Arc::clone(&svc.ctx),
                deps: UpstreamDeps {
                    mad: Arc::clone(&svc.mad),
                    tree: tree.clone(),
                    ctrl: ctrl_mb.clone(),
                    access: access_mb.clone(),
                    downstream: downstream_mb,
                    admin: admin_mb.clone(),
                    rclose: rclose.clone(),
                },
                latest_db: Arc::clone(&svc.latest_db),
            };
            handles.push(spawn_named(format!("ssafab-up-{name}"), move || {
                upstream.run();
            })?);

            if let Some((poll, _mb, inbox)) = svc.down {
                let downstream = DownstreamPipeline {
                    poll,
                    inbox,
                    ctx: svc.ctx,
                    deps: DownstreamDeps {
                        access: access_mb.clone(),
                        admin: admin_mb.clone(),
                        extract: extract_mb.clone(),
                        upstream: svc.up_mb.clone(),
                        rclose: rclose.clone(),
                    },
                };
                handles.push(spawn_named(format!("ssafab-dn-{name}"), move || {
                    downstream.run();
                })?);
            }
        }

        if let Some((poll, _mb, inbox)) = extract_parts {
            let pipeline = ExtractPipeline {
                poll,
                inbox,
                provider: provider.expect("checked above"),
                tree: Arc::clone(tree.as_ref().expect("core node has a tree")),
                mad: Arc::clone(&mads[0]),
                counters: Arc::clone(&counters),
                downstream: downstream_mbs.iter().flatten().cloned().collect(),
                access: access_mb.clone(),
                local_lid: local.lid,
                sm_lid: local.sm_lid,
                tid_seq: 0,
                dump_dir: config
                    .dump
                    .smdb_dump
                    .then(|| config.dump.smdb_dump_dir.clone()),
                tree_dump_level: config.dump.distrib_tree_level,
            };
            handles.push(spawn_named("ssafab-extract".to_string(), move || {
                pipeline.run();
            })?);
        }

        if let Some((poll, _mb, inbox)) = access_parts {
            let nprocs = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
            let pipeline = AccessPipeline {
                poll,
                inbox,
                computer: computer.expect("checked above"),
                counters: Arc::clone(&counters),
                downstream: downstream_mbs.iter().flatten().cloned().collect(),
                upstream: upstream_mbs.clone(),
                extract: extract_mb.clone(),
                workers: worker_count(nprocs),
                prdb_dump_dir: config
                    .dump
                    .prdb_dump
                    .then(|| config.dump.prdb_dump_dir.clone()),
                err_smdb_dump_dir: config
                    .dump
                    .err_smdb_dump
                    .then(|| config.dump.smdb_dump_dir.clone()),
            };
            handles.push(spawn_named("ssafab-access".to_string(), move || {
                pipeline.run();
            })?);
        }

        let admin = AdminPipeline {
            poll: admin_poll,
            inbox: admin_inbox,
            local_gid: local.gid,
            admin_port: config.net.admin_port,
            node_type,
            counters: Arc::clone(&counters),
            downstream: downstream_mbs.iter().flatten().cloned().collect(),
            rclose: rclose.clone(),
        };
        handles.push(spawn_named("ssafab-admin".to_string(), move || {
            admin.run();
        })?);

        let ctrl = CtrlPipeline {
            poll: ctrl_poll,
            inbox: ctrl_inbox,
            mads,
            mad_waker,
            services: svc_db_ids
                .into_iter()
                .zip(upstream_mbs.iter().cloned())
                .zip(downstream_mbs.iter().cloned())
                .map(|((db_id, upstream), downstream)| ServiceLink {
                    db_id,
                    upstream,
                    downstream,
                })
                .collect(),
        };
        handles.push(spawn_named("ssafab-ctrl".to_string(), move || {
            ctrl.run();
        })?);

        Ok(NodeHandle {
            counters,
            tree,
            ctrl: ctrl_mb,
            upstream: upstream_mbs,
            downstream: downstream_mbs,
            extract: extract_mb,
            access: access_mb,
            admin: admin_mb,
            latest_dbs,
            handles,
            rclose: Some(rclose_runner),
        })
    }
}

impl NodeHandle {
    /// Requests an extraction (subnet-up or manual trigger).
    pub fn trigger_extract(&self) -> CoreResult<()> {
        match &self.extract {
            Some(mb) => mb.send(ExtractMsg::StartExtract),
            None => Err(CoreError::Init("node has no extractor".into())),
        }
    }

    /// Queues a forwarding-table-change event.
    pub fn notify_route_change(&self) -> CoreResult<()> {
        match &self.extract {
            Some(mb) => mb.send(ExtractMsg::RouteChange),
            None => Err(CoreError::Init("node has no extractor".into())),
        }
    }

    /// The latest database the given service pulled (or, on a core,
    /// nothing: the core serves from the extractor).
    pub fn latest_db(&self, service: usize) -> Option<Arc<SsaDb>> {
        self.latest_dbs
            .get(service)?
            .lock()
            .expect("latest db slot")
            .clone()
    }

    /// Fans a port event into one service's pipelines, the way the
    /// control thread does for device events.
    pub fn inject_port_event(&self, service: usize, event: PortEvent) -> CoreResult<()> {
        let up = self
            .upstream
            .get(service)
            .ok_or_else(|| CoreError::Init(format!("no service {service}")))?;
        up.send(UpstreamMsg::PortEvent(event))?;
        if let Some(Some(down)) = self.downstream.get(service) {
            down.send(DownstreamMsg::PortEvent(event))?;
        }
        Ok(())
    }

    /// Consumer-local freshness query against the upstream pipeline.
    pub fn db_query(&self, service: usize) -> CoreResult<DbQueryStatus> {
        let mb = self
            .upstream
            .get(service)
            .ok_or_else(|| CoreError::Init(format!("no service {service}")))?;
        let (tx, rx) = bounded(1);
        mb.send(UpstreamMsg::DbQuery(tx))?;
        rx.recv_timeout(Duration::from_secs(10))
            .map_err(|_| CoreError::ChannelClosed)
    }

    /// Sends an exit to every pipeline and joins the threads.
    pub fn shutdown(mut self) {
        info!("node shutting down");
        let _ = self.ctrl.send(CtrlMsg::Exit);
        for mb in &self.upstream {
            let _ = mb.send(UpstreamMsg::Exit);
        }
        for mb in self.downstream.iter().flatten() {
            let _ = mb.send(DownstreamMsg::Exit);
        }
        if let Some(mb) = &self.extract {
            let _ = mb.send(ExtractMsg::Exit);
        }
        if let Some(mb) = &self.access {
            let _ = mb.send(AccessMsg::Exit);
        }
        let _ = self.admin.send(AdminMsg::Exit);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(rclose) = self.rclose.take() {
            rclose.join();
        }
        info!("node shutdown complete");
    }
}

// ----------------------------------------------------------------------
// Control thread
// ----------------------------------------------------------------------

struct ServiceLink {
    db_id: DbId,
    upstream: Mailbox<UpstreamMsg>,
    downstream: Option<Mailbox<DownstreamMsg>>,
}

struct CtrlPipeline {
    poll: Poll,
    inbox: Inbox<CtrlMsg>,
    mads: Vec<Arc<dyn MadPort + Send + Sync>>,
    mad_waker: Arc<Waker>,
    services: Vec<ServiceLink>,
}

impl CtrlPipeline {
    fn run(mut self) {
        info!("control thread running");

        // Wake this poll on any datagram arrival.
        for mad in &self.mads {
            let waker = Arc::clone(&self.mad_waker);
            mad.set_notifier(Box::new(move || {
                let _ = waker.wake();
            }));
        }

        // Port activation: every port in this model starts active.
        for link in &self.services {
            let _ = link.upstream.send(UpstreamMsg::PortEvent(PortEvent::PortActive));
            if let Some(downstream) = &link.downstream {
                let _ = downstream.send(DownstreamMsg::PortEvent(PortEvent::PortActive));
                let _ = downstream.send(DownstreamMsg::Listen);
            }
        }

        let mut events = Events::with_capacity(16);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "control poll failed");
                break;
            }

            loop {
                let Some(msg) = self.inbox.try_recv() else {
                    break;
                };
                match msg {
                    CtrlMsg::ConnRequest(index) => {
                        if let Some(link) = self.services.get(index) {
                            let _ = link.upstream.send(UpstreamMsg::Connect);
                        }
                    }
                    CtrlMsg::Exit => {
                        info!("control thread exiting");
                        return;
                    }
                }
            }

            for mad in &self.mads {
                while let Some(datagram) = mad.try_recv() {
                    self.dispatch(datagram);
                }
            }
        }
    }

    /// Routes one datagram to the owning service: responses and local
    /// send-failure echoes by the service index in the transaction id,
    /// requests by database id.
    fn dispatch(&self, mad: Mad) {
        let index = if mad.local_status != 0 || mad.method.is_response() {
            tid_service_index(mad.tid) as usize
        } else {
            match &mad.attr {
                MadAttr::Member(rec) => self.index_by_db(rec.database_id),
                MadAttr::Info(info) => self.index_by_db(info.database_id),
                // SA path queries carry no database id; the first
                // service owns the SA surface.
                MadAttr::Path(_) => 0,
            }
        };
        let Some(link) = self.services.get(index) else {
            warn!(index, "no matching service for received MAD");
            return;
        };

        // A parent installation implies data traffic is imminent; make
        // sure the listeners are up (no-op when already listening).
        if mad.method == MadMethod::Set && matches!(mad.attr, MadAttr::Info(_)) {
            if let Some(downstream) = &link.downstream {
                let _ = downstream.send(DownstreamMsg::Listen);
            }
        }

        debug!(index, method = ?mad.method, "dispatching MAD");
        if let Err(e) = link.upstream.send(UpstreamMsg::Mad(mad)) {
            warn!(error = %e, "MAD dispatch failed");
        }
    }

    fn index_by_db(&self, db_id: DbId) -> usize {
        self.services
            .iter()
            .position(|link| link.db_id == db_id)
            .unwrap_or(0)
    }
}

fn spawn_named(name: String, body: impl FnOnce() + Send + 'static) -> CoreResult<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(CoreError::Io)
}
