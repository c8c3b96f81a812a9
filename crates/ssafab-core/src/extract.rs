//! Extractor pipeline (core node only).
//!
//! Owns the periodic subnet-state snapshot schedule. An extraction is
//! single-shot: while a prepare/ready handshake is outstanding, further
//! extract requests coalesce. The previous snapshot is retained for
//! exactly one cycle after being superseded.
//!
//! The extractor thread also drives the tree-maintenance timers: the
//! 1 s orphan-adoption tick (armed while orphans exist), the periodic
//! rebalance pass, and the tree dump.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll};
use ssafab_db::{SsaDb, save_db, stamp_epochs};
use ssafab_mad::{Mad, MadAttr, MadMethod, MadPort, PathRecord};
use ssafab_types::Lid;
use tracing::{debug, error, info, warn};

use crate::counters::Counters;
use crate::mailbox::{Inbox, Mailbox};
use crate::msg::{AccessMsg, DbUpdateMsg, DownstreamMsg, ExtractMsg, UpdateSource};
use crate::supervisor::SubnetProvider;
use crate::tree::{PathQuery, TreeManager};

/// Interval between rebalance passes.
pub const BALANCE_INTERVAL: Duration = Duration::from_secs(300);

const ORPHAN_TICK: Duration = Duration::from_secs(1);

/// Everything the extractor thread needs.
pub struct ExtractPipeline {
    pub poll: Poll,
    pub inbox: Inbox<ExtractMsg>,
    pub provider: Arc<dyn SubnetProvider>,
    pub tree: Arc<TreeManager>,
    pub mad: Arc<dyn MadPort + Send + Sync>,
    pub counters: Arc<Counters>,
    /// Downstream pipeline of every service.
    pub downstream: Vec<Mailbox<DownstreamMsg>>,
    /// Access pipeline, when this core is combined.
    pub access: Option<Mailbox<AccessMsg>>,
    /// Local port identity for SA path queries issued during adoption.
    pub local_lid: Lid,
    pub sm_lid: Lid,
    pub tid_seq: u64,
    pub dump_dir: Option<PathBuf>,
    pub tree_dump_level: u32,
}

struct Timers {
    orphan: Option<Instant>,
    balance: Option<Instant>,
}

impl ExtractPipeline {
    /// Runs the extractor until `Exit`.
    pub fn run(mut self) {
        info!("extract pipeline running");
        let mut events = Events::with_capacity(16);
        let mut outstanding = 0usize;
        let mut current: Option<Arc<SsaDb>> = None;
        let mut retired: Option<Arc<SsaDb>> = None;
        let mut extract_queued = false;
        let mut timers = Timers {
            orphan: None,
            balance: None,
        };

        loop {
            let timeout = next_timeout(&timers);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "extract poll failed");
                break;
            }

            while let Some(msg) = self.inbox.try_recv() {
                match msg {
                    ExtractMsg::StartExtract => {
                        if outstanding > 0 {
                            debug!(outstanding, "extract request coalesced");
                            extract_queued = true;
                            continue;
                        }
                        if current.is_some() {
                            outstanding = self.send_prepare();
                            debug!(outstanding, "update prepare fan-out");
                            if outstanding > 0 {
                                continue;
                            }
                        }
                        self.extract(&mut current, &mut retired);
                        timers.arm_after_extract(&self.tree);
                    }
                    ExtractMsg::RouteChange => {
                        // Forwarding-table changes are folded into the
                        // next snapshot; nothing is pushed immediately.
                        debug!("route change queued for next extraction");
                    }
                    ExtractMsg::UpdateReady => {
                        if outstanding == 0 {
                            warn!("unexpected update ready");
                            continue;
                        }
                        outstanding -= 1;
                        debug!(outstanding, "update ready");
                        if outstanding == 0 {
                            self.extract(&mut current, &mut retired);
                            timers.arm_after_extract(&self.tree);
                            if std::mem::take(&mut extract_queued) {
                                // A coalesced request arrived mid-cycle;
                                // run another round.
                                outstanding = self.send_prepare();
                                if outstanding == 0 {
                                    self.extract(&mut current, &mut retired);
                                }
                            }
                        }
                    }
                    ExtractMsg::Exit => {
                        info!("extract pipeline exiting");
                        return;
                    }
                }
            }

            self.service_timers(&mut timers);
        }
    }

    /// Sends `update_prepare` to every downstream pipeline and the
    /// access pipeline; returns the number of acks to await.
    fn send_prepare(&self) -> usize {
        let mut count = 0;
        for mb in &self.downstream {
            if mb.send(DownstreamMsg::UpdatePrepare(UpdateSource::Extract)).is_ok() {
                count += 1;
            }
        }
        if let Some(access) = &self.access {
            if access
                .send(AccessMsg::UpdatePrepare {
                    source: UpdateSource::Extract,
                    service: 0,
                })
                .is_ok()
            {
                count += 1;
            }
        }
        count
    }

    fn extract(&mut self, current: &mut Option<Arc<SsaDb>>, retired: &mut Option<Arc<SsaDb>>) {
        let mut snapshot = self.provider.snapshot();
        if let Err(e) = snapshot.validate() {
            error!(error = %e, "extracted snapshot failed validation");
            return;
        }

        let first = self.tree.finish_first_extraction();
        if first {
            let queries = self.tree.process_orphans();
            self.send_path_queries(&queries);
        }

        let dirty = stamp_epochs(&mut snapshot, current.as_deref());
        let epoch = snapshot.epoch();
        if dirty {
            info!(%epoch, tables = snapshot.table_count(), "publishing extracted snapshot");
        } else {
            // The update still goes out (with the change flag clear) so
            // any open prepare/ready handshake resolves; the epoch does
            // not advance.
            debug!(%epoch, "no effective changes; epoch unchanged");
        }

        if dirty {
            if let Some(dir) = &self.dump_dir {
                if let Err(e) = save_db(dir, &snapshot) {
                    warn!(error = %e, "snapshot dump failed");
                }
            }
        }

        let db = Arc::new(snapshot);
        let update = DbUpdateMsg {
            db: Arc::clone(&db),
            epoch,
            changed: dirty,
            target: None,
        };
        for mb in &self.downstream {
            if let Err(e) = mb.send(DownstreamMsg::SmdbUpdate(update.clone())) {
                warn!(error = %e, "downstream update send failed");
            }
        }
        if let Some(access) = &self.access {
            if let Err(e) = access.send(AccessMsg::SmdbUpdate {
                update: update.clone(),
                service: None,
            }) {
                warn!(error = %e, "access update send failed");
            }
        }
        self.counters.record_db_update(epoch.as_u64());

        // Keep the superseded generation alive for exactly one cycle.
        *retired = current.take();
        *current = Some(db);
    }

    fn service_timers(&mut self, timers: &mut Timers) {
        let now = Instant::now();

        if timers.orphan.is_some_and(|t| t <= now) {
            let queries = self.tree.process_orphans();
            self.send_path_queries(&queries);
            timers.orphan = if self.tree.has_orphans() {
                Some(now + ORPHAN_TICK)
            } else {
                None
            };
            self.dump_tree();
        }

        if timers.balance.is_some_and(|t| t <= now) {
            let queries = self.tree.rebalance();
            self.send_path_queries(&queries);
            timers.balance = Some(now + BALANCE_INTERVAL);
            self.dump_tree();
        }
    }

    fn dump_tree(&self) {
        if let Some(report) = self.tree.dump(self.tree_dump_level) {
            info!("\n{report}");
        }
    }

    /// Issues the SA path queries produced by adoption or rebalancing.
    fn send_path_queries(&mut self, queries: &[PathQuery]) {
        for q in queries {
            self.tid_seq += 1;
            let mad = Mad::request(
                self.local_lid,
                self.sm_lid,
                MadMethod::Get,
                ssafab_mad::encode_tid(0, self.tid_seq),
                MadAttr::Path(PathRecord::new(
                    q.child_gid,
                    Lid::default(),
                    q.parent_gid,
                    Lid::default(),
                )),
            );
            if let Err(e) = self.mad.send(mad) {
                warn!(error = %e, child = %q.child_gid, "path query send failed");
            }
        }
        if !queries.is_empty() {
            self.dump_tree();
        }
    }
}

impl Timers {
    fn arm_after_extract(&mut self, tree: &TreeManager) {
        let now = Instant::now();
        if tree.has_orphans() {
            self.orphan = Some(now + ORPHAN_TICK);
        }
        if self.balance.is_none() {
            self.balance = Some(now + BALANCE_INTERVAL);
        }
    }
}

fn next_timeout(timers: &Timers) -> Option<Duration> {
    let now = Instant::now();
    [timers.orphan, timers.balance]
        .into_iter()
        .flatten()
        .map(|deadline| deadline.saturating_duration_since(now))
        .min()
        // Wake at least once a second while any timer is armed so the
        // orphan tick cannot be starved by a busy mailbox.
        .map(|d| d.min(Duration::from_secs(1)))
}
