//! Wire-level scenarios driven by a hand-rolled client: the
//! mid-transfer update handshake and the admin surface.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use ssafab_admin::AdminClient;
use ssafab_config::FabricConfig;
use ssafab_core::counters::CounterId;
use ssafab_core::supervisor::{Node, NodeHandle, PortDesc, SubnetProvider};
use ssafab_db::testutil::sample_db;
use ssafab_db::{HalfWorldComputer, PrdbComputer, SsaDb};
use ssafab_mad::{LoopbackFabric, MadPort};
use ssafab_types::{DbId, Gid, Lid, NodeType};
use ssafab_wire::{Frame, FrameClass, FrameFlags, FrameHeader, ReplOp};

fn gid(host: u8) -> Gid {
    Gid::from_ipv6(Ipv4Addr::new(127, 0, 0, host).to_ipv6_mapped())
}

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

fn start_combined_core(
    port_base: u16,
    host: u8,
    provider: Arc<TestProvider>,
) -> (NodeHandle, Arc<FabricConfig>) {
    let mut config = FabricConfig::default();
    config.net.smdb_port = port_base;
    config.net.prdb_port = port_base + 1;
    config.net.admin_port = port_base + 2;
    let config = Arc::new(config);

    let fabric = LoopbackFabric::new();
    let lid = Lid::new(1);
    let mad: Arc<dyn MadPort + Send + Sync> = Arc::new(fabric.register(lid));
    let node = Node::start(
        Arc::clone(&config),
        NodeType::CORE | NodeType::ACCESS,
        vec![(
            PortDesc {
                gid: gid(host),
                lid,
                sm_lid: lid,
                sm_sl: 0,
            },
            mad,
        )],
        Some(provider as Arc<dyn SubnetProvider>),
        Some(Arc::new(HalfWorldComputer) as Arc<dyn PrdbComputer>),
    )
    .expect("core start");
    (node, config)
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

/// Minimal blocking replication client for driving the server by hand.
struct RawPuller {
    stream: TcpStream,
    rbuf: BytesMut,
    next_id: u32,
}

impl RawPuller {
    fn connect(server: Gid, port: u16, own: Gid) -> Self {
        let addr = SocketAddr::new(
            server.to_ipv6().to_ipv4_mapped().unwrap().into(),
            port,
        );
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.set_nodelay(true).unwrap();

        // Identification preamble.
        let mut preamble = BytesMut::with_capacity(24);
        preamble.put_u32(0x5353_4146);
        preamble.put_slice(&own.to_bytes());
        preamble.put_u16(99);
        preamble.put_u8(NodeType::CONSUMER.bits());
        preamble.put_u8(0);
        let mut stream = stream;
        stream.write_all(&preamble).unwrap();

        Self {
            stream,
            rbuf: BytesMut::new(),
            next_id: 0,
        }
    }

    fn send_query(&mut self, op: ReplOp) -> u32 {
        self.next_id += 1;
        let frame = Frame::control(FrameHeader::new(
            FrameClass::Db,
            op.to_u16(),
            FrameFlags::END,
            self.next_id,
        ));
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        self.stream.write_all(&out).unwrap();
        self.next_id
    }

    fn read_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = Frame::decode(&mut self.rbuf).unwrap() {
                return frame;
            }
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).unwrap();
            assert!(n > 0, "server closed the connection");
            self.rbuf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Next response frame, skipping asynchronous update notices.
    fn read_response(&mut self) -> Frame {
        loop {
            let frame = self.read_frame();
            if frame.header.repl_op().unwrap() == ReplOp::Update {
                continue;
            }
            assert!(frame.header.flags.contains(FrameFlags::RESP));
            assert_eq!(frame.header.id, self.next_id, "correlation id echo");
            return frame;
        }
    }

    /// Waits for an update notice and returns the epoch it carries.
    fn read_update_notice(&mut self) -> u64 {
        loop {
            let frame = self.read_frame();
            if frame.header.repl_op().unwrap() == ReplOp::Update {
                return frame.header.rdma_addr;
            }
        }
    }

    /// Runs one dataset phase to its `End` terminator, returning the
    /// per-frame payloads (descriptor array first).
    fn drain_dataset(&mut self, op: ReplOp) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        loop {
            self.send_query(op);
            let frame = self.read_response();
            if frame.header.flags.contains(FrameFlags::END) && frame.payload.is_empty() {
                return payloads;
            }
            payloads.push(frame.payload);
        }
    }
}

/// Scenario: mid-transfer update. While a child sits between phases of
/// a pull, a new extraction must defer: the epoch holds at 1 until the
/// transfer drains, then advances to 2 and the child is re-notified.
#[test]
fn update_defers_until_midstream_transfer_completes() {
    let consumer_gid = gid(102);
    let provider = TestProvider::new(sample_db(DbId::PATH_DATA, 2, &[gid(101), consumer_gid]));
    let (core, config) = start_combined_core(18800, 101, Arc::clone(&provider));
    core.trigger_extract().unwrap();
    wait_until("first extraction", Duration::from_secs(10), || {
        core.counters.get(CounterId::DbEpoch) == 1
    });

    let mut puller = RawPuller::connect(gid(101), config.net.smdb_port, consumer_gid);

    // Walk the pull to the middle: defs done, data not yet requested.
    puller.send_query(ReplOp::QueryDef);
    assert!(!puller.read_response().payload.is_empty());
    puller.send_query(ReplOp::QueryTblDef);
    puller.read_response();
    puller.send_query(ReplOp::QueryTblDefDataset);
    puller.read_response();

    // Trigger a changed extraction while the transfer is open.
    provider.set(sample_db(DbId::PATH_DATA, 2, &[gid(101), consumer_gid, gid(103)]));
    core.trigger_extract().unwrap();

    // The swap must wait for us: the epoch may not advance while this
    // connection is mid-phase.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(
        core.counters.get(CounterId::DbEpoch),
        1,
        "epoch advanced during an open transfer"
    );

    // Finish the pull; everything served must still be generation 1.
    puller.drain_dataset(ReplOp::QueryFieldDefDataset);
    let data = puller.drain_dataset(ReplOp::QueryDataDataset);
    assert!(!data.is_empty());

    // With the transfer drained the deferred update proceeds and the
    // child learns the new epoch.
    let epoch = puller.read_update_notice();
    assert_eq!(epoch, 2);
    wait_until("epoch advanced after drain", Duration::from_secs(10), || {
        core.counters.get(CounterId::DbEpoch) == 2
    });

    core.shutdown();
}

/// Admin surface: ping, counters, node-info, and operator disconnect.
#[test]
fn admin_surface_reports_and_disconnects() {
    let consumer_gid = gid(112);
    let provider = TestProvider::new(sample_db(DbId::PATH_DATA, 1, &[gid(111), consumer_gid]));
    let (core, config) = start_combined_core(18900, 111, Arc::clone(&provider));
    core.trigger_extract().unwrap();
    wait_until("first extraction", Duration::from_secs(10), || {
        core.counters.get(CounterId::DbEpoch) == 1
    });

    let mut admin = AdminClient::connect(gid(111), config.net.admin_port).unwrap();
    admin.ping().unwrap();

    let counters = admin.counters().unwrap();
    assert_eq!(counters.epoch.as_u64(), 1);
    assert_eq!(
        counters.values.len(),
        ssafab_core::counters::COUNTER_COUNT
    );
    assert_eq!(counters.values[CounterId::DbEpoch as usize], 1);

    let info = admin.node_info().unwrap();
    assert_eq!(info.node_type, NodeType::CORE | NodeType::ACCESS);
    assert!(!info.version.is_empty());
    assert_eq!(info.db_epoch.as_u64(), 1);

    // A child connection appears in the table once identified.
    let mut puller = RawPuller::connect(gid(111), config.net.smdb_port, consumer_gid);
    puller.send_query(ReplOp::QueryDef);
    puller.read_response();
    wait_until("child visible in node info", Duration::from_secs(10), || {
        admin
            .node_info()
            .unwrap()
            .connections
            .iter()
            .any(|c| c.remote_gid == consumer_gid)
    });

    // Operator disconnect drops it again.
    admin.disconnect(consumer_gid).unwrap();
    wait_until("child gone from node info", Duration::from_secs(10), || {
        admin
            .node_info()
            .unwrap()
            .connections
            .iter()
            .all(|c| c.remote_gid != consumer_gid)
    });

    core.shutdown();
}
