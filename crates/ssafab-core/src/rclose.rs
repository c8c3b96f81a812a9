//! Socket-close offload pool.
//!
//! Releasing an RDMA-backed socket can block for seconds while the
//! verbs resources drain, so pipelines never close data sockets on
//! their own threads: they hand the socket to this pool and move on.
//! The TCP close is cheap, but the offload keeps the pipeline
//! discipline identical to the production transport.

use crossbeam_channel::{Sender, unbounded};
use mio::net::TcpStream;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Number of close workers.
const RCLOSE_WORKERS: usize = 1;

/// Handle to the close pool.
#[derive(Clone)]
pub struct ClosePool {
    tx: Sender<TcpStream>,
}

/// The pool plus its join handles, owned by the supervisor.
pub struct ClosePoolRunner {
    pub pool: ClosePool,
    handles: Vec<JoinHandle<()>>,
}

impl ClosePoolRunner {
    pub fn start() -> Self {
        let (tx, rx) = unbounded::<TcpStream>();
        let mut handles = Vec::with_capacity(RCLOSE_WORKERS);
        for i in 0..RCLOSE_WORKERS {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ssafab-rclose-{i}"))
                .spawn(move || {
                    while let Ok(stream) = rx.recv() {
                        trace!("closing offloaded socket");
                        drop(stream);
                    }
                    debug!("rclose worker exiting");
                })
                .expect("failed to spawn rclose worker");
            handles.push(handle);
        }
        Self {
            pool: ClosePool { tx },
            handles,
        }
    }

    /// Stops the workers after the senders are gone.
    pub fn join(self) {
        drop(self.pool);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

impl ClosePool {
    /// Queues a socket for closing. Falls back to an inline close when
    /// the pool is already shut down.
    pub fn close(&self, stream: TcpStream) {
        if let Err(e) = self.tx.send(stream) {
            drop(e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;
    use ssafab_types::Gid;
    use std::net::Ipv4Addr;

    #[test]
    fn close_runs_off_thread_and_join_drains() {
        let gid = Gid::from_ipv6(Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped());
        let listener = transport::listen(gid, 0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let runner = ClosePoolRunner::start();
        for _ in 0..3 {
            let stream = transport::connect(gid, port, 0).unwrap();
            runner.pool.close(stream);
        }
        runner.join();
    }
}
