//! Admin pipeline: runtime statistics and operator commands.
//!
//! A secondary listener on the admin service id serves `Ping`,
//! `Counter`, `NodeInfo`, and `Disconnect` over the same frame header
//! as replication, with the admin class tag. One client at a time; a
//! new client preempts the old one. The connection table is maintained
//! from the `ConnDone`/`ConnGone` events the data pipelines emit.

use std::collections::HashMap;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use ssafab_types::{Epoch, Gid, NodeType};
use ssafab_wire::{
    AdminOp, ConnInfo, CounterSnapshot, Frame, FrameClass, FrameFlags, FrameHeader, NodeInfo,
    decode_disconnect, encode_counters, encode_node_info,
};
use tracing::{debug, error, info, warn};

use crate::connection::{Conn, ConnRole, ConnState, DbKind};
use crate::counters::{CounterId, Counters};
use crate::mailbox::{Inbox, Mailbox};
use crate::msg::{AdminMsg, ConnEvent, DownstreamMsg};
use crate::rclose::ClosePool;
use crate::transport;
use crate::{CoreError, CoreResult, FABRIC_VERSION};

const LISTEN_TOKEN: Token = Token(1);
const CLIENT_TOKEN: Token = Token(2);

/// The admin pipeline.
pub struct AdminPipeline {
    pub poll: Poll,
    pub inbox: Inbox<AdminMsg>,
    pub local_gid: Gid,
    pub admin_port: u16,
    pub node_type: NodeType,
    pub counters: Arc<Counters>,
    pub downstream: Vec<Mailbox<DownstreamMsg>>,
    pub rclose: ClosePool,
}

type ConnKey = (usize, u128, u8);

impl AdminPipeline {
    /// Runs the admin pipeline until `Exit`.
    pub fn run(mut self) {
        let mut listener = match transport::listen(self.local_gid, self.admin_port) {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, port = self.admin_port, "admin listen failed");
                return;
            }
        };
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)
        {
            error!(error = %e, "admin listener registration failed");
            return;
        }
        info!(port = self.admin_port, "admin pipeline listening");

        let mut events = Events::with_capacity(16);
        let mut client: Option<Conn> = None;
        let mut table: HashMap<ConnKey, ConnEvent> = HashMap::new();

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "admin poll failed");
                break;
            }

            while let Some(msg) = self.inbox.try_recv() {
                match msg {
                    AdminMsg::ConnDone(event) => {
                        table.insert(table_key(&event), event);
                    }
                    AdminMsg::ConnGone(event) => {
                        table.remove(&table_key(&event));
                    }
                    AdminMsg::Exit => {
                        info!("admin pipeline exiting");
                        if let Some(conn) = client.take() {
                            self.rclose.close(conn.stream);
                        }
                        return;
                    }
                }
            }

            for event in &events {
                match event.token() {
                    LISTEN_TOKEN => self.accept(&listener, &mut client),
                    CLIENT_TOKEN => {
                        let mut failed = false;
                        if event.is_writable() {
                            if let Some(conn) = client.as_mut() {
                                if let Err(e) = conn.flush() {
                                    warn!(error = %e, "admin client write failed");
                                    failed = true;
                                }
                            }
                        }
                        if event.is_readable() && !failed {
                            if let Some(conn) = client.as_mut() {
                                match self.service_client(conn, &table) {
                                    Ok(()) => {}
                                    Err(CoreError::ConnectionClosed) => {
                                        debug!("admin client disconnected");
                                        failed = true;
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "admin client error");
                                        failed = true;
                                    }
                                }
                            }
                        }
                        if failed {
                            self.drop_client(&mut client);
                        } else if let Some(conn) = client.as_mut() {
                            let interest = conn.interest();
                            let _ = self.poll.registry().reregister(
                                &mut conn.stream,
                                CLIENT_TOKEN,
                                interest,
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn accept(&self, listener: &TcpListener, client: &mut Option<Conn>) {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "admin client connected");
                    // New client preempts the old one.
                    if let Some(old) = client.take() {
                        warn!("preempting existing admin client");
                        self.deregister_and_close(old);
                    }
                    transport::configure_stream(&stream, 0);
                    if let Some(conn) = self.register_client(stream) {
                        *client = Some(conn);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "admin accept failed");
                    break;
                }
            }
        }
    }

    fn register_client(&self, mut stream: TcpStream) -> Option<Conn> {
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, CLIENT_TOKEN, Interest::READABLE)
        {
            warn!(error = %e, "admin client registration failed");
            return None;
        }
        let mut conn = Conn::new(stream, CLIENT_TOKEN, ConnRole::Listen, DbKind::None);
        conn.state = ConnState::Connected;
        // Admin clients are local operator tools; no preamble.
        conn.skip_preamble();
        Some(conn)
    }

    fn drop_client(&self, client: &mut Option<Conn>) {
        if let Some(conn) = client.take() {
            self.deregister_and_close(conn);
        }
    }

    fn deregister_and_close(&self, mut conn: Conn) {
        let _ = self.poll.registry().deregister(&mut conn.stream);
        self.rclose.close(conn.stream);
    }

    fn service_client(&self, conn: &mut Conn, table: &HashMap<ConnKey, ConnEvent>) -> CoreResult<()> {
        for frame in conn.recv_frames()? {
            if frame.header.class != FrameClass::Admin {
                warn!("non-admin frame on admin connection");
                return Err(CoreError::ConnectionClosed);
            }
            let op = AdminOp::from_u16(frame.header.op)?;
            debug!(?op, id = frame.header.id, "admin request");
            match op {
                AdminOp::Ping => {
                    let header = FrameHeader {
                        flags: frame.header.flags | FrameFlags::RESP,
                        ..frame.header
                    };
                    conn.send_frame(&Frame::control(header))?;
                }
                AdminOp::Counter => {
                    let snapshot = CounterSnapshot {
                        epoch: Epoch::new(self.counters.get(CounterId::DbEpoch)),
                        values: self.counters.snapshot(),
                    };
                    let header = FrameHeader::new(
                        FrameClass::Admin,
                        AdminOp::Counter.to_u16(),
                        FrameFlags::RESP | FrameFlags::END,
                        frame.header.id,
                    );
                    conn.send_frame(&Frame::new(header, encode_counters(&snapshot)))?;
                }
                AdminOp::NodeInfo => {
                    let info = NodeInfo {
                        node_type: self.node_type,
                        version: FABRIC_VERSION.to_string(),
                        db_epoch: Epoch::new(self.counters.get(CounterId::DbEpoch)),
                        connections: table.values().map(conn_info).collect(),
                    };
                    let header = FrameHeader::new(
                        FrameClass::Admin,
                        AdminOp::NodeInfo.to_u16(),
                        FrameFlags::RESP | FrameFlags::END,
                        frame.header.id,
                    );
                    conn.send_frame(&Frame::new(header, encode_node_info(&info)))?;
                }
                AdminOp::Disconnect => {
                    let gid = decode_disconnect(&frame.payload)?;
                    info!(%gid, "operator disconnect request");
                    for mb in &self.downstream {
                        let _ = mb.send(DownstreamMsg::Disconnect(gid));
                    }
                    let header = FrameHeader::new(
                        FrameClass::Admin,
                        AdminOp::Disconnect.to_u16(),
                        FrameFlags::RESP | FrameFlags::END,
                        frame.header.id,
                    );
                    conn.send_frame(&Frame::control(header))?;
                }
            }
        }
        Ok(())
    }
}

fn table_key(event: &ConnEvent) -> ConnKey {
    (
        event.service,
        u128::from(event.remote_gid),
        event.role.as_u8(),
    )
}

fn conn_info(event: &ConnEvent) -> ConnInfo {
    ConnInfo {
        conn_type: event.role.as_u8(),
        db_kind: event.db_kind.as_u8(),
        remote_node_type: event.remote_node_type,
        remote_lid: event.remote_lid,
        remote_gid: event.remote_gid,
        connected_at: event.connected_at,
    }
}
