//! In-process MAD fabric.
//!
//! Routes datagrams between registered ports by LID. A send to an
//! unregistered LID is echoed back to the sender with a nonzero
//! `local_status`, which is how the umad stack reports an ack timeout;
//! the upstream join machine reacts by doubling its timeout and
//! scheduling a rejoin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use ssafab_types::Lid;
use tracing::trace;

use crate::{Mad, MadError, MadPort, MadResult};

/// Transport-level status used for undeliverable datagrams.
pub const LOCAL_STATUS_TIMEOUT: u16 = 110;

type Notifier = Box<dyn Fn() + Send + Sync>;

struct PortSlot {
    tx: Sender<Mad>,
    notifier: Arc<Mutex<Option<Notifier>>>,
}

/// An in-process datagram switch.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    ports: Arc<Mutex<HashMap<Lid, PortSlot>>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a port at `lid`, replacing any previous registration.
    pub fn register(&self, lid: Lid) -> LoopbackPort {
        let (tx, rx) = unbounded();
        let notifier = Arc::new(Mutex::new(None));
        self.ports.lock().expect("fabric lock").insert(
            lid,
            PortSlot {
                tx,
                notifier: Arc::clone(&notifier),
            },
        );
        LoopbackPort {
            lid,
            fabric: self.clone(),
            rx,
            notifier,
        }
    }

    /// Drops the registration at `lid`; later sends to it bounce.
    pub fn unregister(&self, lid: Lid) {
        self.ports.lock().expect("fabric lock").remove(&lid);
    }

    fn deliver(&self, to: Lid, mad: Mad) -> bool {
        let ports = self.ports.lock().expect("fabric lock");
        let Some(slot) = ports.get(&to) else {
            return false;
        };
        if slot.tx.send(mad).is_err() {
            return false;
        }
        if let Some(notify) = slot.notifier.lock().expect("notifier lock").as_ref() {
            notify();
        }
        true
    }
}

/// One endpoint on the loopback fabric.
pub struct LoopbackPort {
    lid: Lid,
    fabric: LoopbackFabric,
    rx: Receiver<Mad>,
    notifier: Arc<Mutex<Option<Notifier>>>,
}

impl LoopbackPort {
    pub fn lid(&self) -> Lid {
        self.lid
    }
}

impl MadPort for LoopbackPort {
    fn send(&self, mad: Mad) -> MadResult<()> {
        let to = mad.to;
        trace!(from = %mad.from, %to, method = ?mad.method, "loopback MAD send");
        if self.fabric.deliver(to, mad.clone()) {
            return Ok(());
        }
        // Undeliverable: bounce a local failure echo to the sender, the
        // way umad surfaces an unacked send.
        let mut echo = mad;
        echo.local_status = LOCAL_STATUS_TIMEOUT;
        if !self.fabric.deliver(self.lid, echo) {
            return Err(MadError::PortClosed);
        }
        Ok(())
    }

    fn try_recv(&self) -> Option<Mad> {
        self.rx.try_recv().ok()
    }

    fn set_notifier(&self, notify: Box<dyn Fn() + Send + Sync>) {
        *self.notifier.lock().expect("notifier lock") = Some(notify);
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        // Only drop the slot if it is still ours; a re-register at the
        // same LID must not be torn down by the old port going away.
        let mut ports = self.fabric.ports.lock().expect("fabric lock");
        if let Some(slot) = ports.get(&self.lid) {
            if Arc::ptr_eq(&slot.notifier, &self.notifier) {
                ports.remove(&self.lid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemberRecord;
    use crate::{MadAttr, MadMethod};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn member_set(from: Lid, to: Lid) -> Mad {
        Mad::request(
            from,
            to,
            MadMethod::Set,
            1,
            MadAttr::Member(MemberRecord::default()),
        )
    }

    #[test]
    fn delivers_between_registered_ports() {
        let fabric = LoopbackFabric::new();
        let a = fabric.register(Lid::new(1));
        let b = fabric.register(Lid::new(2));

        a.send(member_set(Lid::new(1), Lid::new(2))).unwrap();
        let got = b.try_recv().unwrap();
        assert_eq!(got.from, Lid::new(1));
        assert_eq!(got.local_status, 0);
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn unroutable_send_bounces_with_timeout_status() {
        let fabric = LoopbackFabric::new();
        let a = fabric.register(Lid::new(1));

        a.send(member_set(Lid::new(1), Lid::new(9))).unwrap();
        let echo = a.try_recv().unwrap();
        assert_eq!(echo.local_status, LOCAL_STATUS_TIMEOUT);
    }

    #[test]
    fn notifier_fires_on_delivery() {
        let fabric = LoopbackFabric::new();
        let a = fabric.register(Lid::new(1));
        let b = fabric.register(Lid::new(2));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        b.set_notifier(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        a.send(member_set(Lid::new(1), Lid::new(2))).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_makes_later_sends_bounce() {
        let fabric = LoopbackFabric::new();
        let a = fabric.register(Lid::new(1));
        let b = fabric.register(Lid::new(2));
        drop(b);
        fabric.unregister(Lid::new(2));

        a.send(member_set(Lid::new(1), Lid::new(2))).unwrap();
        assert_eq!(a.try_recv().unwrap().local_status, LOCAL_STATUS_TIMEOUT);
    }
}
