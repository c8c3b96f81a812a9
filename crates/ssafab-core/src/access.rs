//! Access pipeline (access-role nodes only).
//!
//! Consumes SMDB updates (from the extractor on a combined core, from
//! the upstream pipeline on a pure access node) and consumer arrival
//! events from the downstream pipelines. For every consumer it derives
//! a personalized database through the [`PrdbComputer`] seam, stamps a
//! per-consumer epoch, and queues the result to a dedicated publisher
//! thread which forwards it to the owning downstream pipeline.
//!
//! Computation fans out over a worker pool sized `max(1, nprocs - 3)`;
//! the driver waits on a completion condition variable before touching
//! its consumer map again or accepting the next SMDB.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Poll};
use ssafab_db::{PrdbComputer, PrdbOutcome, SsaDb, save_db};
use ssafab_types::{Epoch, Gid, Lid};
use tracing::{debug, error, info, warn};

use crate::counters::{CounterId, Counters};
use crate::mailbox::{Inbox, Mailbox};
use crate::msg::{AccessMsg, DbUpdateMsg, DownstreamMsg, ExtractMsg, PeerId, UpdateSource, UpstreamMsg};

/// Upper bound on pool workers.
pub const MAX_ACCESS_WORKERS: usize = 0xFFFF;

/// Sizes the worker pool from the processor count.
pub fn worker_count(nprocs: usize) -> usize {
    let workers = if nprocs > 3 { nprocs - 3 } else { 1 };
    workers.min(MAX_ACCESS_WORKERS)
}

/// One tracked consumer.
struct AccessMember {
    gid: Gid,
    lid: Lid,
    /// Last PRDB produced for this consumer.
    prdb_current: Option<Arc<SsaDb>>,
    /// SMDB epoch the current PRDB was produced from.
    smdb_epoch: Epoch,
    connected: bool,
}

/// Inputs of one PRDB computation task.
struct Task {
    service: usize,
    gid: Gid,
    lid: Lid,
    smdb: Arc<SsaDb>,
    prev_prdb: Option<Arc<SsaDb>>,
    smdb_epoch: Epoch,
}

/// Result of a finished task, applied to the map by the driver.
struct TaskResult {
    service: usize,
    gid: Gid,
    prdb: Option<Arc<SsaDb>>,
    smdb_epoch: Epoch,
}

/// A PRDB ready for delivery.
struct Publication {
    service: usize,
    peer: PeerId,
    db: Arc<SsaDb>,
    epoch: Epoch,
}

struct PoolShared {
    in_flight: Mutex<usize>,
    done: Condvar,
    tasks_gauge: AtomicUsize,
}

/// The access pipeline and its helper threads.
pub struct AccessPipeline {
    pub poll: Poll,
    pub inbox: Inbox<AccessMsg>,
    pub computer: Arc<dyn PrdbComputer>,
    pub counters: Arc<Counters>,
    /// Downstream pipeline per service (PRDB delivery target).
    pub downstream: Vec<Mailbox<DownstreamMsg>>,
    /// Upstream pipeline per service (update-ready replies).
    pub upstream: Vec<Mailbox<UpstreamMsg>>,
    /// Extractor (update-ready replies on a combined core).
    pub extract: Option<Mailbox<ExtractMsg>>,
    pub workers: usize,
    pub prdb_dump_dir: Option<PathBuf>,
    pub err_smdb_dump_dir: Option<PathBuf>,
}

impl AccessPipeline {
    /// Runs the access driver until `Exit`.
    pub fn run(mut self) {
        info!(workers = self.workers, "access pipeline running");

        let shared = Arc::new(PoolShared {
            in_flight: Mutex::new(0),
            done: Condvar::new(),
            tasks_gauge: AtomicUsize::new(0),
        });
        let (publish_tx, publish_rx) = unbounded::<Publication>();
        let (result_tx, result_rx) = unbounded::<TaskResult>();
        let publisher = self.spawn_publisher(publish_rx);
        let (task_tx, worker_handles) =
            self.spawn_workers(&shared, publish_tx.clone(), result_tx.clone());

        let mut maps: Vec<HashMap<Gid, AccessMember>> =
            (0..self.downstream.len()).map(|_| HashMap::new()).collect();
        let mut smdb: Option<Arc<SsaDb>> = None;
        let mut update_waiting = false;

        let mut events = Events::with_capacity(16);
        'outer: loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "access poll failed");
                break;
            }

            while let Some(msg) = self.inbox.try_recv() {
                match msg {
                    AccessMsg::UpdatePrepare { source, service } => {
                        if update_waiting {
                            warn!("unexpected update prepare while already waiting");
                        }
                        update_waiting = true;
                        self.send_ready(source, service);
                    }
                    AccessMsg::SmdbUpdate { update, service } => {
                        update_waiting = false;
                        if !update.changed {
                            debug!("unchanged SMDB update; keeping current PRDBs");
                            continue;
                        }
                        smdb = Some(Arc::clone(&update.db));
                        self.recompute(
                            &update,
                            service,
                            &mut maps,
                            &task_tx,
                            &shared,
                            &publish_tx,
                            &result_tx,
                        );
                        self.drain_results(&result_rx, &mut maps);
                    }
                    AccessMsg::ConnDone(event) => {
                        let service = event.service;
                        let Some(map) = maps.get_mut(service) else {
                            warn!(service, "conn done for unknown service");
                            continue;
                        };
                        let member = map.entry(event.remote_gid).or_insert(AccessMember {
                            gid: event.remote_gid,
                            lid: event.remote_lid,
                            prdb_current: None,
                            smdb_epoch: Epoch::INVALID,
                            connected: true,
                        });
                        member.lid = event.remote_lid;
                        member.connected = true;

                        if update_waiting {
                            debug!(
                                gid = %event.remote_gid,
                                "update in flight; PRDB deferred until after it"
                            );
                            continue;
                        }
                        let Some(current) = smdb.clone() else {
                            debug!("no SMDB yet; consumer waits for first update");
                            continue;
                        };

                        // Re-issue the cached PRDB when still current,
                        // else compute synchronously for this consumer.
                        if let (Some(prdb), true) = (
                            member.prdb_current.clone(),
                            member.smdb_epoch == current.epoch(),
                        ) {
                            let epoch = prdb.epoch();
                            let _ = publish_tx.send(Publication {
                                service,
                                peer: PeerId {
                                    gid: member.gid,
                                    lid: member.lid,
                                },
                                db: prdb,
                                epoch,
                            });
                        } else {
                            let task = Task {
                                service,
                                gid: member.gid,
                                lid: member.lid,
                                smdb: current,
                                prev_prdb: member.prdb_current.clone(),
                                smdb_epoch: member.smdb_epoch,
                            };
                            run_task(
                                &task,
                                self.computer.as_ref(),
                                &publish_tx,
                                &result_tx,
                                self.prdb_dump_dir.as_deref(),
                                self.err_smdb_dump_dir.as_deref(),
                            );
                            self.drain_results(&result_rx, &mut maps);
                        }
                    }
                    AccessMsg::ConnGone(event) => {
                        if let Some(member) = maps
                            .get_mut(event.service)
                            .and_then(|m| m.get_mut(&event.remote_gid))
                        {
                            member.connected = false;
                            debug!(gid = %event.remote_gid, "consumer connection gone");
                        }
                    }
                    AccessMsg::Exit => {
                        info!("access pipeline exiting");
                        break 'outer;
                    }
                }
            }
        }

        drop(task_tx);
        for handle in worker_handles {
            let _ = handle.join();
        }
        drop(publish_tx);
        let _ = publisher.join();
    }

    fn send_ready(&self, source: UpdateSource, service: usize) {
        let sent = match source {
            UpdateSource::Extract => self
                .extract
                .as_ref()
                .map(|mb| mb.send(ExtractMsg::UpdateReady))
                .transpose()
                .is_ok(),
            UpdateSource::Upstream => self
                .upstream
                .get(service)
                .map(|mb| mb.send(UpstreamMsg::UpdateReady))
                .transpose()
                .is_ok(),
        };
        if !sent {
            warn!(?source, "update ready delivery failed");
        }
    }

    /// Recomputes PRDBs for all consumers of `service` (or all
    /// services) against the new SMDB, then waits for completion.
    #[allow(clippy::too_many_arguments)]
    fn recompute(
        &self,
        update: &DbUpdateMsg,
        service: Option<usize>,
        maps: &mut [HashMap<Gid, AccessMember>],
        task_tx: &Sender<Task>,
        shared: &Arc<PoolShared>,
        publish_tx: &Sender<Publication>,
        result_tx: &Sender<TaskResult>,
    ) {
        for (index, map) in maps.iter().enumerate() {
            if service.is_some_and(|s| s != index) {
                continue;
            }
            for member in map.values() {
                let task = Task {
                    service: index,
                    gid: member.gid,
                    lid: member.lid,
                    smdb: Arc::clone(&update.db),
                    prev_prdb: member.prdb_current.clone(),
                    smdb_epoch: member.smdb_epoch,
                };
                if self.workers > 1 {
                    {
                        let mut in_flight = shared.in_flight.lock().expect("pool lock");
                        *in_flight += 1;
                    }
                    let gauge = shared.tasks_gauge.fetch_add(1, Ordering::Relaxed) + 1;
                    self.counters.set(CounterId::NumAccessTasks, gauge as u64);
                    if task_tx.send(task).is_err() {
                        let mut in_flight = shared.in_flight.lock().expect("pool lock");
                        *in_flight -= 1;
                    }
                } else {
                    run_task(
                        &task,
                        self.computer.as_ref(),
                        publish_tx,
                        result_tx,
                        self.prdb_dump_dir.as_deref(),
                        self.err_smdb_dump_dir.as_deref(),
                    );
                }
            }
        }
        self.wait_for_completion(shared);
        self.counters.set(CounterId::NumAccessTasks, 0);
    }

    fn wait_for_completion(&self, shared: &Arc<PoolShared>) {
        if self.workers <= 1 {
            return;
        }
        let mut in_flight = shared.in_flight.lock().expect("pool lock");
        while *in_flight > 0 {
            in_flight = shared.done.wait(in_flight).expect("pool lock");
        }
    }

    fn drain_results(
        &self,
        result_rx: &Receiver<TaskResult>,
        maps: &mut [HashMap<Gid, AccessMember>],
    ) {
        while let Ok(result) = result_rx.try_recv() {
            if let Some(member) = maps
                .get_mut(result.service)
                .and_then(|m| m.get_mut(&result.gid))
            {
                if let Some(prdb) = result.prdb {
                    member.prdb_current = Some(prdb);
                    member.smdb_epoch = result.smdb_epoch;
                }
            }
        }
    }

    fn spawn_publisher(&self, rx: Receiver<Publication>) -> JoinHandle<()> {
        let downstream = self.downstream.clone();
        std::thread::Builder::new()
            .name("ssafab-prdb-pub".to_string())
            .spawn(move || {
                while let Ok(publication) = rx.recv() {
                    let Some(mb) = downstream.get(publication.service) else {
                        continue;
                    };
                    let msg = DownstreamMsg::PrdbUpdate(DbUpdateMsg {
                        db: publication.db,
                        epoch: publication.epoch,
                        changed: true,
                        target: Some(publication.peer),
                    });
                    if let Err(e) = mb.send(msg) {
                        warn!(error = %e, "PRDB delivery failed");
                    }
                }
                debug!("PRDB publisher exiting");
            })
            .expect("failed to spawn PRDB publisher")
    }

    fn spawn_workers(
        &self,
        shared: &Arc<PoolShared>,
        publish_tx: Sender<Publication>,
        result_tx: Sender<TaskResult>,
    ) -> (Sender<Task>, Vec<JoinHandle<()>>) {
        let (task_tx, task_rx) = unbounded::<Task>();
        let mut handles = Vec::new();
        if self.workers > 1 {
            for i in 0..self.workers {
                let rx = task_rx.clone();
                let shared = Arc::clone(shared);
                let computer = Arc::clone(&self.computer);
                let publish = publish_tx.clone();
                let results = result_tx.clone();
                let prdb_dump = self.prdb_dump_dir.clone();
                let err_dump = self.err_smdb_dump_dir.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("ssafab-access-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            run_task(
                                &task,
                                computer.as_ref(),
                                &publish,
                                &results,
                                prdb_dump.as_deref(),
                                err_dump.as_deref(),
                            );
                            shared.tasks_gauge.fetch_sub(1, Ordering::Relaxed);
                            let mut in_flight = shared.in_flight.lock().expect("pool lock");
                            *in_flight -= 1;
                            shared.done.notify_all();
                        }
                    })
                    .expect("failed to spawn access worker");
                handles.push(handle);
            }
        }
        (task_tx, handles)
    }
}

/// Computes one consumer's PRDB and, when it differs from the previous
/// one, stamps the successor epoch and queues it for publication.
fn run_task(
    task: &Task,
    computer: &dyn PrdbComputer,
    publish_tx: &Sender<Publication>,
    result_tx: &Sender<TaskResult>,
    prdb_dump_dir: Option<&std::path::Path>,
    err_smdb_dump_dir: Option<&std::path::Path>,
) {
    let smdb_epoch = task.smdb.epoch();
    debug!(gid = %task.gid, lid = %task.lid, "computing PRDB");

    let prdb = match computer.compute(&task.smdb, task.gid) {
        PrdbOutcome::Db(prdb) => prdb,
        PrdbOutcome::PortAbsent => {
            if task.smdb_epoch.is_valid() {
                warn!(
                    gid = %task.gid,
                    epoch = %smdb_epoch,
                    last = %task.smdb_epoch,
                    "consumer no longer present in SMDB"
                );
            } else {
                warn!(gid = %task.gid, epoch = %smdb_epoch, "consumer not present in SMDB");
            }
            if let Some(dir) = err_smdb_dump_dir {
                let dir = dir.join(format!("epoch-{}", smdb_epoch.as_u64()));
                if let Err(e) = save_db(&dir, &task.smdb) {
                    warn!(error = %e, "error-SMDB dump failed");
                }
            }
            return;
        }
    };

    if let Some(prev) = &task.prev_prdb {
        if prdb.same_content(prev) {
            debug!(gid = %task.gid, "PRDB unchanged; not republished");
            return;
        }
    }

    let prev_epoch = task
        .prev_prdb
        .as_ref()
        .map_or(Epoch::INVALID, |p| p.epoch());
    let epoch = prev_epoch.next();
    let mut prdb = prdb;
    prdb.set_epoch(epoch);

    if let Some(dir) = prdb_dump_dir {
        let dir = dir.join(format!("{}", task.gid));
        if let Err(e) = save_db(&dir, &prdb) {
            warn!(error = %e, "PRDB dump failed");
        }
    }

    let prdb = Arc::new(prdb);
    let _ = result_tx.send(TaskResult {
        service: task.service,
        gid: task.gid,
        prdb: Some(Arc::clone(&prdb)),
        smdb_epoch,
    });
    let _ = publish_tx.send(Publication {
        service: task.service,
        peer: PeerId {
            gid: task.gid,
            lid: task.lid,
        },
        db: prdb,
        epoch,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1, 1; "single proc keeps one worker")]
    #[test_case(3, 1; "three procs keep one worker")]
    #[test_case(4, 1; "four procs leave one worker")]
    #[test_case(8, 5; "eight procs leave five workers")]
    fn worker_sizing(nprocs: usize, expected: usize) {
        assert_eq!(worker_count(nprocs), expected);
    }

    #[test]
    fn worker_sizing_is_capped() {
        assert_eq!(worker_count(usize::MAX), MAX_ACCESS_WORKERS);
    }
}
