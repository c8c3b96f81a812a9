//! End-to-end fabric scenarios over loopback.
//!
//! Each test stands up real nodes (core/combined, access, consumer)
//! sharing one in-process MAD fabric and distinct 127/8 loopback
//! identities, then drives the distribution protocol through the real
//! sockets. Port numbers are per-test so the suites can run in
//! parallel.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ssafab_config::FabricConfig;
use ssafab_core::msg::{DbQueryStatus, PortEvent};
use ssafab_core::supervisor::{Node, NodeHandle, PortDesc, SubnetProvider};
use ssafab_db::testutil::sample_db;
use ssafab_db::{HalfWorldComputer, PrdbComputer, SsaDb};
use ssafab_mad::{LoopbackFabric, MadPort};
use ssafab_types::{DbId, Epoch, Gid, Lid, NodeType};

fn gid(host: u8) -> Gid {
    Gid::from_ipv6(Ipv4Addr::new(127, 0, 0, host).to_ipv6_mapped())
}

/// Provider whose snapshot content the test can change between
/// extractions.
struct TestProvider {
    db: Mutex<SsaDb>,
}

impl TestProvider {
    fn new(db: SsaDb) -> Arc<Self> {
        Arc::new(Self { db: Mutex::new(db) })
    }

    fn set(&self, db: SsaDb) {
        *self.db.lock().unwrap() = db;
    }
}

impl SubnetProvider for TestProvider {
    fn snapshot(&self) -> SsaDb {
        self.db.lock().unwrap().clone()
    }
}

struct TestFabric {
    fabric: LoopbackFabric,
    config: Arc<FabricConfig>,
}

impl TestFabric {
    /// `port_base` must be unique per test.
    fn new(port_base: u16) -> Self {
        let mut config = FabricConfig::default();
        config.net.smdb_port = port_base;
        config.net.prdb_port = port_base + 1;
        config.net.admin_port = port_base + 2;
        config.timing.rejoin_timeout = 1;
        config.timing.reconnect_timeout = 1;
        config.timing.reconnect_max_count = 2;
        Self {
            fabric: LoopbackFabric::new(),
            config: Arc::new(config),
        }
    }

    fn port(&self, host: u8, lid: u16, sm_lid: u16) -> (PortDesc, Arc<dyn MadPort + Send + Sync>) {
        let desc = PortDesc {
            gid: gid(host),
            lid: Lid::new(lid),
            sm_lid: Lid::new(sm_lid),
            sm_sl: 0,
        };
        let mad: Arc<dyn MadPort + Send + Sync> = Arc::new(self.fabric.register(Lid::new(lid)));
        (desc, mad)
    }

    fn start_core(&self, host: u8, lid: u16, provider: Arc<TestProvider>, combined: bool) -> NodeHandle {
        let node_type = if combined {
            NodeType::CORE | NodeType::ACCESS
        } else {
            NodeType::CORE
        };
        let computer: Option<Arc<dyn PrdbComputer>> =
            combined.then(|| Arc::new(HalfWorldComputer) as Arc<dyn PrdbComputer>);
        Node::start(
            Arc::clone(&self.config),
            node_type,
            vec![self.port(host, lid, lid)],
            Some(provider as Arc<dyn SubnetProvider>),
            computer,
        )
        .expect("core start")
    }

    fn start_access(&self, host: u8, lid: u16, sm_lid: u16) -> NodeHandle {
        Node::start(
            Arc::clone(&self.config),
            NodeType::ACCESS,
            vec![self.port(host, lid, sm_lid)],
            None,
            Some(Arc::new(HalfWorldComputer) as Arc<dyn PrdbComputer>),
        )
        .expect("access start")
    }

    fn start_consumer(&self, host: u8, lid: u16, sm_lid: u16) -> NodeHandle {
        Node::start(
            Arc::clone(&self.config),
            NodeType::CONSUMER,
            vec![self.port(host, lid, sm_lid)],
            None,
            None,
        )
        .expect("consumer start")
    }
}

fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

const LONG: Duration = Duration::from_secs(20);

/// Scenario: single consumer under a combined core. The consumer joins,
/// is parented by the core, connects to the SMDB service id, and pulls
/// a database equal to the extractor snapshot at epoch 1.
#[test]
fn single_consumer_pulls_smdb_from_core() {
    let fabric = TestFabric::new(18100);
    let consumer_gid = gid(12);
    let subnet = sample_db(DbId::PATH_DATA, 2, &[gid(11), consumer_gid]);
    let provider = TestProvider::new(subnet.clone());

    let core = fabric.start_core(11, 1, Arc::clone(&provider), true);
    core.trigger_extract().unwrap();
    wait_until("first extraction", LONG, || {
        core.counters.get(ssafab_core::counters::CounterId::DbEpoch) == 1
    });

    let consumer = fabric.start_consumer(12, 20, 1);
    wait_until("consumer pulled the SMDB", LONG, || {
        consumer
            .latest_db(0)
            .is_some_and(|db| db.epoch() == Epoch::new(1))
    });

    let pulled = consumer.latest_db(0).unwrap();
    let mut expected = subnet;
    ssafab_db::stamp_epochs(&mut expected, None);
    assert_eq!(pulled.as_ref(), &expected);

    // The core's member map shows the parented consumer.
    let tree = core.tree.as_ref().unwrap();
    assert_eq!(
        tree.with_member(consumer_gid, |m| m.primary).flatten(),
        Some(gid(11))
    );
    assert!(tree.check_invariants().is_empty());

    consumer.shutdown();
    core.shutdown();
}

/// Scenario: balanced bringup. Four access nodes join first, then
/// sixteen consumers one at a time; every consumer lands on the access
/// node with the lowest consumer count.
#[test]
fn balanced_bringup_of_access_and_consumers() {
    let fabric = TestFabric::new(18200);
    let mut member_gids = vec![gid(21)];
    for i in 0..4u8 {
        member_gids.push(gid(30 + i));
    }
    for i in 0..16u8 {
        member_gids.push(gid(40 + i));
    }
    let provider = TestProvider::new(sample_db(DbId::PATH_DATA, 1, &member_gids));

    let core = fabric.start_core(21, 1, Arc::clone(&provider), false);
    core.trigger_extract().unwrap();
    let tree = core.tree.as_ref().unwrap().clone();
    wait_until("first extraction", LONG, || !tree.is_first_extraction());

    let mut access_nodes = Vec::new();
    for i in 0..4u8 {
        let node = fabric.start_access(30 + i, 30 + u16::from(i), 1);
        let access_gid = gid(30 + i);
        wait_until("access node parented", LONG, || {
            tree.with_member(access_gid, |m| m.primary)
                .flatten()
                .is_some()
        });
        access_nodes.push(node);
    }

    let mut consumers = Vec::new();
    for i in 0..16u8 {
        let node = fabric.start_consumer(40 + i, 100 + u16::from(i), 1);
        let consumer_gid = gid(40 + i);
        wait_until("consumer parented", LONG, || {
            tree.with_member(consumer_gid, |m| m.primary)
                .flatten()
                .is_some()
        });
        consumers.push(node);
    }

    for i in 0..4u8 {
        let count = tree
            .with_member(gid(30 + i), |m| m.access_child_count())
            .unwrap();
        assert_eq!(count, 4, "access node {i} should hold exactly 4 consumers");
    }
    assert!(tree.check_invariants().is_empty());

    for node in consumers {
        node.shutdown();
    }
    for node in access_nodes {
        node.shutdown();
    }
    core.shutdown();
}

/// Scenario: consumers under a pure access node receive PRDBs derived
/// from the SMDB, with per-consumer epochs, via the epoch-word
/// publication path.
#[test]
fn consumer_under_access_receives_prdb() {
    let fabric = TestFabric::new(18300);
    let consumer_gid = gid(52);
    let provider = TestProvider::new(sample_db(
        DbId::PATH_DATA,
        2,
        &[gid(50), gid(51), consumer_gid],
    ));

    let core = fabric.start_core(50, 1, Arc::clone(&provider), false);
    core.trigger_extract().unwrap();
    let tree = core.tree.as_ref().unwrap().clone();
    wait_until("first extraction", LONG, || !tree.is_first_extraction());

    let access = fabric.start_access(51, 30, 1);
    wait_until("access pulled the SMDB", LONG, || {
        access
            .latest_db(0)
            .is_some_and(|db| db.epoch() == Epoch::new(1))
    });

    let consumer = fabric.start_consumer(52, 40, 1);
    wait_until("consumer parented to access", LONG, || {
        tree.with_member(consumer_gid, |m| m.primary).flatten() == Some(gid(51))
    });

    // The access node computes the PRDB and publishes the epoch; the
    // consumer-local query observes the change and pulls.
    wait_until("PRDB epoch published to consumer", LONG, || {
        matches!(consumer.db_query(0), Ok(DbQueryStatus::EpochChanged))
    });
    wait_until("consumer pulled the PRDB", LONG, || {
        consumer.latest_db(0).is_some()
    });

    let prdb = consumer.latest_db(0).unwrap();
    assert_eq!(prdb.epoch(), Epoch::new(1), "first PRDB generation");
    // Personalized: only this consumer's records survive.
    for meta in &prdb.data_meta {
        assert_eq!(meta.set_count, 1);
    }
    for data in &prdb.data {
        assert_eq!(&data[..16], &consumer_gid.to_bytes());
    }

    // No new generation without a subnet change.
    assert!(matches!(
        consumer.db_query(0),
        Ok(DbQueryStatus::EpochNotChanged)
    ));

    consumer.shutdown();
    access.shutdown();
    core.shutdown();
}

/// Scenario: a consumer joining while no access node exists is denied
/// and self-heals once an access node joins.
#[test]
fn rejected_consumer_retries_until_access_exists() {
    let fabric = TestFabric::new(18400);
    let consumer_gid = gid(62);
    let provider = TestProvider::new(sample_db(DbId::PATH_DATA, 1, &[gid(60), gid(61), consumer_gid]));

    let core = fabric.start_core(60, 1, Arc::clone(&provider), false);
    core.trigger_extract().unwrap();
    let tree = core.tree.as_ref().unwrap().clone();
    wait_until("first extraction", LONG, || !tree.is_first_extraction());

    let consumer = fabric.start_consumer(62, 40, 1);
    wait_until("denied consumer recorded as orphan", LONG, || {
        tree.with_member(consumer_gid, |m| m.primary.is_none())
            .unwrap_or(false)
    });
    assert!(consumer.latest_db(0).is_none());

    // Once an access node joins, the waiting orphan is adopted and the
    // consumer's retry succeeds.
    let access = fabric.start_access(61, 30, 1);
    wait_until("consumer adopted under access", LONG, || {
        tree.with_member(consumer_gid, |m| m.primary).flatten() == Some(gid(61))
    });
    wait_until("consumer received data after adoption", LONG, || {
        // The freshness query is what kicks the PRDB pull off once the
        // access node publishes a new epoch.
        let _ = consumer.db_query(0);
        consumer.latest_db(0).is_some()
    });

    consumer.shutdown();
    access.shutdown();
    core.shutdown();
}

/// Scenario: subnet-manager change clears the member map; the tree is
/// rebuilt from the next extraction.
#[test]
fn sm_change_clears_and_rebuilds_tree() {
    let fabric = TestFabric::new(18500);
    let provider = TestProvider::new(sample_db(DbId::PATH_DATA, 1, &[gid(70), gid(71)]));

    let core = fabric.start_core(70, 1, Arc::clone(&provider), false);
    core.trigger_extract().unwrap();
    let tree = core.tree.as_ref().unwrap().clone();
    wait_until("first extraction", LONG, || !tree.is_first_extraction());
    wait_until("core member present", LONG, || tree.member_count() >= 1);

    core.inject_port_event(0, PortEvent::SmChange).unwrap();
    wait_until("tree cleared and back to pre-extraction state", LONG, || {
        tree.is_first_extraction()
    });

    // Joins are accepted but deferred until the next extraction.
    wait_until("core rejoined as orphan", LONG, || {
        tree.with_member(gid(70), |m| m.primary.is_none()).unwrap_or(false)
    });

    // Change the subnet so the next extraction is dirty and rebuilds.
    provider.set(sample_db(DbId::PATH_DATA, 2, &[gid(70), gid(71)]));
    core.trigger_extract().unwrap();
    wait_until("tree rebuilt after SM change", LONG, || {
        !tree.is_first_extraction()
            && tree
                .with_member(gid(70), |m| m.primary.is_some())
                .unwrap_or(false)
    });

    core.shutdown();
}

/// Scenario: epoch advance. A second extraction with changed content
/// advances the SMDB epoch by exactly one and re-notifies the child.
#[test]
fn changed_extraction_advances_epoch_monotonically() {
    let fabric = TestFabric::new(18600);
    let consumer_gid = gid(82);
    let provider = TestProvider::new(sample_db(DbId::PATH_DATA, 1, &[gid(81), consumer_gid]));

    let core = fabric.start_core(81, 1, Arc::clone(&provider), true);
    core.trigger_extract().unwrap();
    let consumer = fabric.start_consumer(82, 20, 1);
    wait_until("initial pull", LONG, || {
        consumer
            .latest_db(0)
            .is_some_and(|db| db.epoch() == Epoch::new(1))
    });

    // Unchanged re-extraction must not advance the epoch.
    core.trigger_extract().unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        core.counters.get(ssafab_core::counters::CounterId::DbEpoch),
        1
    );

    // Changed content advances to exactly 2.
    let changed = sample_db(DbId::PATH_DATA, 1, &[gid(81), consumer_gid, gid(83)]);
    provider.set(changed);
    core.trigger_extract().unwrap();
    wait_until("consumer observed epoch 2", LONG, || {
        consumer
            .latest_db(0)
            .is_some_and(|db| db.epoch() == Epoch::new(2))
    });

    consumer.shutdown();
    core.shutdown();
}

/// Scenario: parent loss and recovery. The consumer's access parent
/// dies; after the bounded reconnect attempts the consumer rejoins
/// with `bad_parent` and is re-homed on the surviving access node.
#[test]
fn parent_loss_escalates_to_bad_parent_rejoin() {
    let fabric = TestFabric::new(18700);
    let consumer_gid = gid(93);
    let provider = TestProvider::new(sample_db(
        DbId::PATH_DATA,
        1,
        &[gid(90), gid(91), gid(92), consumer_gid],
    ));

    let core = fabric.start_core(90, 1, Arc::clone(&provider), false);
    core.trigger_extract().unwrap();
    let tree = core.tree.as_ref().unwrap().clone();
    wait_until("first extraction", LONG, || !tree.is_first_extraction());

    let access_a = fabric.start_access(91, 30, 1);
    wait_until("first access parented", LONG, || {
        tree.with_member(gid(91), |m| m.primary).flatten().is_some()
    });

    let consumer = fabric.start_consumer(93, 40, 1);
    wait_until("consumer on first access", LONG, || {
        tree.with_member(consumer_gid, |m| m.primary).flatten() == Some(gid(91))
    });

    let access_b = fabric.start_access(92, 31, 1);
    wait_until("second access parented", LONG, || {
        tree.with_member(gid(92), |m| m.primary).flatten().is_some()
    });

    // Kill the consumer's parent. Reconnects fail, then the consumer
    // rejoins flagging the dead parent, and placement must exclude it.
    access_a.shutdown();
    wait_until(
        "consumer re-homed on surviving access",
        Duration::from_secs(40),
        || tree.with_member(consumer_gid, |m| m.primary).flatten() == Some(gid(92)),
    );

    consumer.shutdown();
    access_b.shutdown();
    core.shutdown();
}
