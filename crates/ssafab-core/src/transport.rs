//! Reliable-stream transport for replication and admin links.
//!
//! The production fabric runs these links over rsockets (reliable RDMA
//! streams with TCP semantics). That library is outside this workspace;
//! this module is the seam. It implements the same surface over TCP:
//! GIDs map 1:1 onto IPv6 addresses, so the AF_IB service address
//! `(gid, service-id port)` becomes `(gid-as-ipv6, port)`. The
//! one-sided RDMA epoch write is carried as an epoch-bearing `Update`
//! frame on the same stream (see the connection engine).
//!
//! Socket discipline matches the original: `SO_REUSEADDR` on listeners,
//! `TCP_NODELAY` and non-blocking on every data socket, keep-alive with
//! the operator-set idle time on accepted and initiated connections.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use socket2::{SockRef, TcpKeepalive};
use ssafab_types::Gid;
use tracing::{debug, warn};

/// The service address for a (gid, port) pair.
///
/// IPv4-mapped GIDs resolve to the embedded IPv4 address; anything in
/// `127.0.0.0/8` is bindable on loopback, which is what the in-process
/// simulations use for per-node identities.
pub fn service_addr(gid: Gid, port: u16) -> SocketAddr {
    let ipv6 = gid.to_ipv6();
    match ipv6.to_ipv4_mapped() {
        Some(ipv4) => SocketAddr::new(ipv4.into(), port),
        None => SocketAddr::new(ipv6.into(), port),
    }
}

/// Opens a non-blocking listener on the port's service address.
///
/// `mio` binds with `SO_REUSEADDR` set, matching the rsocket listener
/// discipline.
pub fn listen(gid: Gid, port: u16) -> io::Result<TcpListener> {
    let addr = service_addr(gid, port);
    let listener = TcpListener::bind(addr)?;
    debug!(%addr, "listening");
    Ok(listener)
}

/// Starts a non-blocking connect toward a peer's service address.
///
/// The returned stream is `Connecting` until writability plus a clear
/// `SO_ERROR` confirm establishment.
pub fn connect(gid: Gid, port: u16, keepalive_secs: u32) -> io::Result<TcpStream> {
    let addr = service_addr(gid, port);
    let stream = TcpStream::connect(addr)?;
    configure_stream(&stream, keepalive_secs);
    Ok(stream)
}

/// Applies the per-connection socket options. Failures are logged, not
/// fatal: a connection without keep-alive still replicates.
pub fn configure_stream(stream: &TcpStream, keepalive_secs: u32) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY");
    }
    if keepalive_secs > 0 {
        let sock = SockRef::from(stream);
        let params = TcpKeepalive::new().with_time(Duration::from_secs(u64::from(keepalive_secs)));
        if let Err(e) = sock.set_tcp_keepalive(&params) {
            warn!(error = %e, "failed to enable keep-alive");
        }
    }
}

/// Checks a connecting socket for asynchronous connect completion.
///
/// Returns `Ok(())` when the connect finished successfully and the
/// deferred error otherwise.
pub fn connect_result(stream: &TcpStream) -> io::Result<()> {
    match stream.take_error()? {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn loopback_gid(host: u8) -> Gid {
        Gid::from_ipv6(Ipv4Addr::new(127, 0, 0, host).to_ipv6_mapped())
    }

    #[test]
    fn ipv4_mapped_gid_resolves_to_v4_loopback() {
        let addr = service_addr(loopback_gid(9), 7475);
        assert_eq!(addr.port(), 7475);
        assert_eq!(addr.ip(), std::net::IpAddr::from(Ipv4Addr::new(127, 0, 0, 9)));
    }

    #[test]
    fn plain_gid_resolves_to_v6() {
        let gid = Gid::new(0xfe80_0000_0000_0000_0000_0000_0000_0001);
        let addr = service_addr(gid, 7476);
        assert_eq!(addr.ip(), std::net::IpAddr::from(gid.to_ipv6()));
    }

    #[test]
    fn listen_and_connect_on_loopback() {
        let listener = listen(loopback_gid(1), 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect(loopback_gid(1), port, 60).unwrap();
        // Non-blocking connect: completion is reported through the
        // poll; here it is enough that no immediate error surfaced.
        drop(stream);
    }

    #[test]
    fn distinct_loopback_hosts_bind_independently() {
        let a = listen(loopback_gid(2), 0).unwrap();
        let port = a.local_addr().unwrap().port();
        // Same port on a different 127/8 host must not collide.
        let b = listen(loopback_gid(3), port);
        assert!(b.is_ok());
    }
}
