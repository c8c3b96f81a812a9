//! Distribution-tree membership and placement (core node only).
//!
//! The member map is keyed by GID; role lists hold GID handles, never
//! pointers, and every removal path evicts the handle from all lists.
//! All mutation happens under the single member-list lock. Join
//! processing is serialized by holding that lock across the whole
//! operation.
//!
//! Placement balances child counts at join time; a periodic rebalance
//! pass caps per-parent fanout at ⌈children / parents⌉ per layer and
//! re-adopts the shed members. Rebalancing is only accurate during
//! bringup: counters are not maintained for members that leave.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ssafab_mad::{InfoRecord, MemberRecord, PathRecord};
use ssafab_types::{Gid, Lid, NodeType};
use tracing::{debug, info, warn};

/// Tree layers selected for the periodic dump (`distrib_tree_level`).
pub const DUMP_CORE: u32 = 1 << 0;
pub const DUMP_DISTRIB: u32 = 1 << 1;
pub const DUMP_ACCESS: u32 = 1 << 2;
pub const DUMP_CONSUMER: u32 = 1 << 3;

/// Parenthood linkage state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Idle,
    Parented,
}

/// One joined member.
#[derive(Debug)]
pub struct Member {
    pub rec: MemberRecord,
    pub lid: Lid,
    pub sl: u8,
    pub primary: Option<Gid>,
    pub primary_state: ChildState,
    /// Reserved; the selection policy never sets a secondary parent.
    pub secondary: Option<Gid>,
    pub secondary_state: ChildState,
    pub join_start: Instant,
    child_count: AtomicU64,
    access_child_count: AtomicU64,
}

impl Member {
    fn new(rec: MemberRecord, lid: Lid) -> Self {
        Self {
            rec,
            lid,
            sl: 0,
            primary: None,
            primary_state: ChildState::Idle,
            secondary: None,
            secondary_state: ChildState::Idle,
            join_start: Instant::now(),
            child_count: AtomicU64::new(0),
            access_child_count: AtomicU64::new(0),
        }
    }

    pub fn child_count(&self) -> u64 {
        self.child_count.load(Ordering::Relaxed)
    }

    pub fn access_child_count(&self) -> u64 {
        self.access_child_count.load(Ordering::Relaxed)
    }
}

/// Outcome of a join request.
#[derive(Debug, PartialEq, Eq)]
pub struct JoinOutcome {
    /// MAD status for the join response; zero on success.
    pub status: u16,
    /// SA path queries the caller must issue to complete attaches
    /// (the join itself plus any orphan adoptions it unlocked).
    pub path_queries: Vec<PathQuery>,
}

/// An SA path query from child toward parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathQuery {
    pub child_gid: Gid,
    pub parent_gid: Gid,
}

/// Parent installation to send to a child after path resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentAssignment {
    pub child_lid: Lid,
    pub child_sl: u8,
    pub info: InfoRecord,
}

struct TreeState {
    members: HashMap<Gid, Member>,
    orphans: Vec<Gid>,
    core_list: Vec<Gid>,
    distrib_list: Vec<Gid>,
    access_list: Vec<Gid>,
    /// Bumped whenever the tree shape changes; drives dump dedup.
    shape_epoch: u64,
    dumped_epoch: u64,
    first_extraction: bool,
}

/// The core node's membership and placement engine.
pub struct TreeManager {
    state: Mutex<TreeState>,
    local_gid: Gid,
    join_timeout: Duration,
}

impl TreeManager {
    pub fn new(local_gid: Gid, join_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(TreeState {
                members: HashMap::new(),
                orphans: Vec::new(),
                core_list: Vec::new(),
                distrib_list: Vec::new(),
                access_list: Vec::new(),
                shape_epoch: 0,
                dumped_epoch: 0,
                first_extraction: true,
            }),
            local_gid,
            join_timeout,
        }
    }

    /// Processes a membership Set: insert-or-update the member, pick a
    /// parent, and attempt the attach.
    pub fn on_join(&self, rec: MemberRecord, lid: Lid) -> JoinOutcome {
        let mut state = self.state.lock().expect("member list lock");
        let gid = rec.port_gid;

        if let Some(member) = state.members.get_mut(&gid) {
            // Rejoin: refresh the record, pull it off the orphan list
            // until placement decides again.
            member.rec = rec;
            member.lid = lid;
        } else {
            debug!(%gid, node_type = %rec.node_type, "adding new member");
            state.members.insert(gid, Member::new(rec, lid));
        }
        remove_handle(&mut state.orphans, gid);

        if state.first_extraction {
            // No parent decisions before the first extraction; accept
            // and leave the member orphaned.
            state.orphans.push(gid);
            return JoinOutcome {
                status: 0,
                path_queries: Vec::new(),
            };
        }

        let join_time_passed = state.members[&gid].join_start.elapsed();
        let parent = self.find_best_parent(&state, gid, join_time_passed);

        let Some(parent_gid) = parent else {
            let node_type = state.members[&gid].rec.node_type;
            let in_grace = node_type == NodeType::ACCESS
                && !state.members[&gid].rec.parent_gid.is_zero()
                && !state.members[&gid].rec.bad_parent
                && join_time_passed < self.join_timeout;
            state.orphans.push(gid);
            if in_grace {
                // Waiting for the previous parent to rejoin; not an
                // error yet.
                return JoinOutcome {
                    status: 0,
                    path_queries: Vec::new(),
                };
            }
            return JoinOutcome {
                status: ssafab_mad::MAD_STATUS_REQ_DENIED,
                path_queries: Vec::new(),
            };
        };

        let mut queries = Vec::new();
        if self.build_tree(&mut state, gid, parent_gid, &mut queries) {
            let node_type = state.members[&gid].rec.node_type;
            if node_type.contains(NodeType::DISTRIBUTION) {
                self.adopt_orphans(&mut state, NodeType::ACCESS, &mut queries);
                self.adopt_orphans(&mut state, NodeType::CONSUMER, &mut queries);
            } else if node_type.contains(NodeType::ACCESS) {
                self.adopt_orphans(&mut state, NodeType::CONSUMER, &mut queries);
            }
            state.shape_epoch += 1;
        } else {
            state.orphans.push(gid);
        }

        JoinOutcome {
            status: 0,
            path_queries: queries,
        }
    }

    /// Processes a membership Delete: detach and forget the member.
    pub fn on_leave(&self, gid: Gid) {
        let mut state = self.state.lock().expect("member list lock");
        remove_handle(&mut state.orphans, gid);
        remove_handle(&mut state.core_list, gid);
        remove_handle(&mut state.distrib_list, gid);
        remove_handle(&mut state.access_list, gid);

        let Some(member) = state.members.get(&gid) else {
            return;
        };
        let node_type = member.rec.node_type;
        let parent = member.primary;

        if !node_type.contains(NodeType::CORE) {
            if let Some(parent_gid) = parent {
                if let Some(parent) = state.members.get(&parent_gid) {
                    if node_type.contains(NodeType::CONSUMER) {
                        parent.access_child_count.fetch_sub(1, Ordering::Relaxed);
                    } else {
                        parent.child_count.fetch_sub(1, Ordering::Relaxed);
                    }
                } else {
                    warn!(%parent_gid, "leaving member's parent not in map");
                }
            }
        }
        state.members.remove(&gid);
        state.shape_epoch += 1;
        debug!(%gid, "member removed");
    }

    /// Completes a pending attach from a resolved SA path record: the
    /// joined port is the path's SGID, the parent its DGID. Returns the
    /// parent installation to send to the child.
    pub fn on_path_record(&self, path: &PathRecord) -> Option<ParentAssignment> {
        let mut state = self.state.lock().expect("member list lock");

        if !state.members.contains_key(&path.sgid) {
            warn!(gid = %path.sgid, "path record for unknown joined port");
            return None;
        }

        let parent_info = state
            .members
            .get(&path.dgid)
            .map(|p| p.rec.node_type);
        let db_id = state.members[&path.sgid].rec.database_id;

        let child = state.members.get_mut(&path.sgid).expect("checked above");
        match parent_info {
            Some(parent_type) => {
                child.primary = Some(path.dgid);
                child.primary_state = ChildState::Parented;
                child.sl = path.sl;
                child.rec.parent_gid = path.dgid;
                child.rec.bad_parent = false;
                let assignment = ParentAssignment {
                    child_lid: child.lid,
                    child_sl: child.sl,
                    info: InfoRecord {
                        database_id: db_id,
                        parent_node_type: parent_type,
                        path: *path,
                    },
                };
                Some(assignment)
            }
            None => {
                child.primary = None;
                child.primary_state = ChildState::Idle;
                warn!(parent = %path.dgid, "resolved path names an unknown parent");
                Some(ParentAssignment {
                    child_lid: child.lid,
                    child_sl: child.sl,
                    info: InfoRecord {
                        database_id: db_id,
                        parent_node_type: NodeType::NONE,
                        path: *path,
                    },
                })
            }
        }
    }

    /// Rolls back the optimistic child-count increment after a failed
    /// path resolution.
    pub fn on_path_record_failure(&self, child_gid: Gid, parent_gid: Gid) {
        let state = self.state.lock().expect("member list lock");
        let Some(child) = state.members.get(&child_gid) else {
            return;
        };
        let Some(parent) = state.members.get(&parent_gid) else {
            return;
        };
        if child.rec.node_type.contains(NodeType::CONSUMER) {
            parent.access_child_count.fetch_sub(1, Ordering::Relaxed);
        } else if !child.rec.node_type.contains(NodeType::CORE) {
            parent.child_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Attempts to re-adopt every orphan, by role from the top of the
    /// tree downward.
    pub fn process_orphans(&self) -> Vec<PathQuery> {
        let mut state = self.state.lock().expect("member list lock");
        let mut queries = Vec::new();
        for role in [
            NodeType::CORE,
            NodeType::DISTRIBUTION,
            NodeType::ACCESS,
            NodeType::CONSUMER,
        ] {
            self.adopt_orphans(&mut state, role, &mut queries);
        }
        queries
    }

    pub fn has_orphans(&self) -> bool {
        !self.state.lock().expect("member list lock").orphans.is_empty()
    }

    /// Periodic rebalance: caps per-parent fanout per layer at
    /// ⌈children/parents⌉, sheds the excess to the orphan list, then
    /// re-adopts.
    pub fn rebalance(&self) -> Vec<PathQuery> {
        let mut state = self.state.lock().expect("member list lock");
        let mut queries = Vec::new();

        let distrib_count = state.distrib_list.len() as u64;
        let access_count = state.access_list.len() as u64;
        let consumer_count = state
            .members
            .values()
            .filter(|m| m.rec.node_type.contains(NodeType::CONSUMER))
            .count() as u64;

        if distrib_count > 0 {
            let max = access_count.div_ceil(distrib_count);
            if max > 0 {
                self.shed_layer(&mut state, NodeType::ACCESS, max);
            }
        }
        if access_count > 0 {
            let max = consumer_count.div_ceil(access_count);
            if max > 0 {
                self.shed_layer(&mut state, NodeType::CONSUMER, max);
            }
        }

        self.adopt_orphans(&mut state, NodeType::ACCESS, &mut queries);
        self.adopt_orphans(&mut state, NodeType::CONSUMER, &mut queries);
        queries
    }

    /// Clears the whole tree after a subnet-manager change; membership
    /// rebuilds from the next extraction.
    pub fn clean(&self) {
        let mut state = self.state.lock().expect("member list lock");
        state.members.clear();
        state.orphans.clear();
        state.core_list.clear();
        state.distrib_list.clear();
        state.access_list.clear();
        state.first_extraction = true;
        state.shape_epoch += 1;
        info!("distribution tree cleared");
    }

    /// Marks the first extraction as done; parent decisions start.
    pub fn finish_first_extraction(&self) -> bool {
        let mut state = self.state.lock().expect("member list lock");
        let was_first = state.first_extraction;
        state.first_extraction = false;
        was_first
    }

    pub fn is_first_extraction(&self) -> bool {
        self.state.lock().expect("member list lock").first_extraction
    }

    /// Renders the tree report when the shape changed since the last
    /// dump. `level` is the layer bitmask; zero disables dumping.
    pub fn dump(&self, level: u32) -> Option<String> {
        if level == 0 {
            return None;
        }
        let mut state = self.state.lock().expect("member list lock");
        if state.shape_epoch == state.dumped_epoch {
            return None;
        }
        state.dumped_epoch = state.shape_epoch;
        Some(render_tree(&state, level))
    }

    /// Member count (for the admin surface and tests).
    pub fn member_count(&self) -> usize {
        self.state.lock().expect("member list lock").members.len()
    }

    /// Runs `f` over a member under the list lock.
    pub fn with_member<T>(&self, gid: Gid, f: impl FnOnce(&Member) -> T) -> Option<T> {
        let state = self.state.lock().expect("member list lock");
        state.members.get(&gid).map(f)
    }

    /// Verifies the §8 well-formedness invariants, returning the list
    /// of violations. Intended for tests and debug assertions.
    pub fn check_invariants(&self) -> Vec<String> {
        let state = self.state.lock().expect("member list lock");
        let mut violations = Vec::new();
        for (gid, member) in &state.members {
            if let Some(parent_gid) = member.primary {
                let Some(parent) = state.members.get(&parent_gid) else {
                    violations.push(format!("{gid}: parent {parent_gid} not in map"));
                    continue;
                };
                let child_type = member.rec.node_type;
                let admissible = if child_type.contains(NodeType::CONSUMER) {
                    parent.rec.node_type.contains(NodeType::ACCESS)
                } else if child_type == NodeType::ACCESS {
                    parent.rec.node_type.intersects(NodeType::DISTRIBUTION | NodeType::CORE)
                } else {
                    parent.rec.node_type.contains(NodeType::CORE)
                };
                if !admissible {
                    violations.push(format!(
                        "{gid} ({}) parented by {parent_gid} ({})",
                        child_type, parent.rec.node_type
                    ));
                }
            }
            let in_orphans = state.orphans.contains(gid);
            if member.primary.is_some() && in_orphans {
                violations.push(format!("{gid}: parented but on orphan list"));
            }
        }
        for (gid, member) in &state.members {
            let counted: u64 = state
                .members
                .values()
                .filter(|m| {
                    m.primary == Some(*gid)
                        && m.primary_state == ChildState::Parented
                        && !m.rec.node_type.contains(NodeType::CONSUMER)
                        && !m.rec.node_type.contains(NodeType::CORE)
                })
                .count() as u64;
            if member.child_count() < counted {
                violations.push(format!(
                    "{gid}: child_count {} < parented children {counted}",
                    member.child_count()
                ));
            }
        }
        violations
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// The parent-selection policy.
    fn find_best_parent(
        &self,
        state: &TreeState,
        child_gid: Gid,
        join_time_passed: Duration,
    ) -> Option<Gid> {
        let child = &state.members[&child_gid];

        // Stickiness: a live parent is kept unless reported bad.
        if let Some(primary) = child.primary {
            if !child.rec.bad_parent {
                return Some(primary);
            }
        }

        let node_type = child.rec.node_type;
        if node_type.contains(NodeType::CORE) || node_type.contains(NodeType::DISTRIBUTION) {
            Some(self.local_gid)
        } else if node_type == NodeType::ACCESS {
            if !child.rec.parent_gid.is_zero()
                && !child.rec.bad_parent
                && join_time_passed < self.join_timeout
            {
                // Preserve the previous tree formation while its
                // parent may still rejoin.
                return state
                    .members
                    .contains_key(&child.rec.parent_gid)
                    .then_some(child.rec.parent_gid);
            }
            if state.distrib_list.is_empty() {
                Some(self.local_gid)
            } else {
                least_loaded(state, &state.distrib_list, child, false)
            }
        } else if node_type == NodeType::CONSUMER {
            least_loaded(state, &state.access_list, child, true)
        } else {
            warn!(node_type = %node_type, "no placement rule for node type");
            None
        }
    }

    /// Inserts the child into its role lists and issues the path query
    /// toward the chosen parent. Returns false when the join cannot be
    /// completed (the member stays orphaned).
    fn build_tree(
        &self,
        state: &mut TreeState,
        child_gid: Gid,
        parent_gid: Gid,
        queries: &mut Vec<PathQuery>,
    ) -> bool {
        let node_type = state.members[&child_gid].rec.node_type;

        if node_type.contains(NodeType::CORE) {
            push_handle(&mut state.core_list, child_gid);
        }
        if node_type.contains(NodeType::DISTRIBUTION) {
            push_handle(&mut state.distrib_list, child_gid);
        }
        if node_type.contains(NodeType::ACCESS) {
            push_handle(&mut state.access_list, child_gid);
        }

        queries.push(PathQuery {
            child_gid,
            parent_gid,
        });

        // Count optimistically; a failed path resolution rolls back.
        if let Some(parent) = state.members.get(&parent_gid) {
            if node_type.contains(NodeType::CONSUMER) {
                parent.access_child_count.fetch_add(1, Ordering::Relaxed);
            } else if !node_type.contains(NodeType::CORE) {
                parent.child_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Caller must hold the list lock (enforced by taking `state`).
    fn adopt_orphans(
        &self,
        state: &mut TreeState,
        role: NodeType,
        queries: &mut Vec<PathQuery>,
    ) {
        let candidates: Vec<Gid> = state
            .orphans
            .iter()
            .copied()
            .filter(|gid| {
                state
                    .members
                    .get(gid)
                    .is_some_and(|m| m.rec.node_type.intersects(role))
            })
            .collect();

        let mut changed = false;
        for gid in candidates {
            let join_time_passed = if state.members[&gid].rec.node_type == NodeType::ACCESS {
                state.members[&gid].join_start.elapsed()
            } else {
                Duration::ZERO
            };
            let Some(parent_gid) = self.find_best_parent(state, gid, join_time_passed) else {
                continue;
            };
            if self.build_tree(state, gid, parent_gid, queries) {
                remove_handle(&mut state.orphans, gid);
                changed = true;
            }
        }
        if changed {
            state.shape_epoch += 1;
        }
    }

    /// Sheds children beyond `max_children` for every parent in one
    /// layer, resetting their membership parent hints so re-adoption
    /// distributes them anew.
    fn shed_layer(&self, state: &mut TreeState, child_role: NodeType, max_children: u64) {
        let members: Vec<Gid> = state
            .members
            .iter()
            .filter(|(_, m)| m.rec.node_type.intersects(child_role))
            .map(|(gid, _)| *gid)
            .collect();

        info!(
            role = %child_role,
            max_children,
            "rebalancing layer"
        );

        for gid in members {
            let Some(member) = state.members.get(&gid) else {
                continue;
            };
            if member.primary_state != ChildState::Parented {
                continue;
            }
            let Some(parent_gid) = member.primary else {
                continue;
            };
            let Some(parent) = state.members.get(&parent_gid) else {
                continue;
            };

            let over = if child_role.contains(NodeType::CONSUMER) {
                parent.access_child_count() > max_children
            } else {
                parent.child_count() > max_children
            };
            if !over {
                continue;
            }

            if child_role.contains(NodeType::CONSUMER) {
                parent.access_child_count.fetch_sub(1, Ordering::Relaxed);
            } else {
                parent.child_count.fetch_sub(1, Ordering::Relaxed);
            }

            let member = state.members.get_mut(&gid).expect("present above");
            member.primary = None;
            member.primary_state = ChildState::Idle;
            member.secondary = None;
            member.secondary_state = ChildState::Idle;
            member.rec.parent_gid = Gid::ZERO;
            push_handle(&mut state.orphans, gid);
            if child_role.contains(NodeType::ACCESS) {
                remove_handle(&mut state.access_list, gid);
            }
        }
    }
}

/// Least-loaded selection with zero-load short-circuit and bad-parent
/// exclusion.
fn least_loaded(
    state: &TreeState,
    list: &[Gid],
    child: &Member,
    by_access_count: bool,
) -> Option<Gid> {
    let mut best: Option<(Gid, u64)> = None;
    for gid in list {
        let Some(candidate) = state.members.get(gid) else {
            continue;
        };
        if child.rec.bad_parent && child.rec.parent_gid == *gid {
            continue;
        }
        let load = if by_access_count {
            candidate.access_child_count()
        } else {
            candidate.child_count()
        };
        if best.map_or(true, |(_, b)| load < b) {
            best = Some((*gid, load));
            if load == 0 {
                break;
            }
        }
    }
    best.map(|(gid, _)| gid)
}

fn push_handle(list: &mut Vec<Gid>, gid: Gid) {
    if !list.contains(&gid) {
        list.push(gid);
    }
}

fn remove_handle(list: &mut Vec<Gid>, gid: Gid) {
    list.retain(|g| *g != gid);
}

fn render_tree(state: &TreeState, level: u32) -> String {
    let consumer_count = state
        .members
        .values()
        .filter(|m| m.rec.node_type.contains(NodeType::CONSUMER))
        .count();

    let mut out = String::new();
    let _ = writeln!(out, "General distribution tree info");
    let _ = writeln!(out, "------------------------------------");
    let _ = writeln!(out, "| Core nodes:           {:10} |", state.core_list.len());
    let _ = writeln!(out, "| Distribution nodes:   {:10} |", state.distrib_list.len());
    let _ = writeln!(out, "| Access nodes:         {:10} |", state.access_list.len());
    let _ = writeln!(out, "| Consumer nodes:       {:10} |", consumer_count);
    let _ = writeln!(out, "------------------------------------");

    let render_member = |out: &mut String, member: &Member, show_access_children: bool| {
        let parent = match member.primary {
            Some(_) if member.primary_state == ChildState::Parented => {
                let lid = member
                    .primary
                    .and_then(|p| state.members.get(&p))
                    .map_or(0, |p| p.lid.as_u16());
                format!("parent LID {lid}")
            }
            _ => "no parent".to_string(),
        };
        let children = if show_access_children {
            member.access_child_count()
        } else {
            member.child_count()
        };
        let _ = writeln!(
            out,
            "[ ({}) GID {} LID {} DB {} ] [ {parent} ] [ children {children} ]",
            member.rec.node_type, member.rec.port_gid, member.lid, member.rec.database_id,
        );
    };

    if level & DUMP_CORE != 0 {
        let _ = writeln!(out, "[ Core nodes ]");
        for gid in &state.core_list {
            if let Some(m) = state.members.get(gid) {
                render_member(&mut out, m, false);
            }
        }
    }
    if level & DUMP_DISTRIB != 0 {
        let _ = writeln!(out, "[ Distribution nodes ]");
        for gid in &state.distrib_list {
            if let Some(m) = state.members.get(gid) {
                render_member(&mut out, m, false);
            }
        }
    }
    if level & (DUMP_ACCESS | DUMP_CONSUMER) != 0 {
        let _ = writeln!(out, "[ Access nodes ]");
        for gid in &state.access_list {
            if let Some(m) = state.members.get(gid) {
                render_member(&mut out, m, true);
            }
            if level & DUMP_CONSUMER != 0 {
                for consumer in state
                    .members
                    .values()
                    .filter(|m| m.rec.node_type.contains(NodeType::CONSUMER) && m.primary == Some(*gid))
                {
                    render_member(&mut out, consumer, true);
                }
            }
        }
    }
    out
}
