//! Cross-thread mailboxes: a bounded channel paired with a poll waker.
//!
//! Every pipeline thread blocks in `mio::Poll::poll`; a message sent to
//! it must both enqueue the value and wake the poll. A [`Mailbox`] is
//! the sending half (cheap to clone, safe to hand to any thread); the
//! [`Inbox`] stays with the owning pipeline and is drained after each
//! wake. Messages are bounded so a stalled pipeline applies
//! back-pressure to its producers.

use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use mio::{Registry, Token, Waker};
use tracing::warn;

use crate::{CoreError, CoreResult};

/// Default mailbox depth.
pub const MAILBOX_CAPACITY: usize = 256;

/// Creates a connected mailbox/inbox pair whose waker is registered on
/// `registry` under `token`.
pub fn mailbox<T>(registry: &Registry, token: Token) -> io::Result<(Mailbox<T>, Inbox<T>)> {
    let (tx, rx) = bounded(MAILBOX_CAPACITY);
    let waker = Arc::new(Waker::new(registry, token)?);
    Ok((Mailbox { tx, waker }, Inbox { rx }))
}

/// Sending half of a pipeline mailbox.
pub struct Mailbox<T> {
    tx: Sender<T>,
    waker: Arc<Waker>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl<T> Mailbox<T> {
    /// Sends a message, blocking if the receiving pipeline is behind.
    ///
    /// Fails only when the receiving pipeline has exited.
    pub fn send(&self, msg: T) -> CoreResult<()> {
        self.tx.send(msg).map_err(|_| CoreError::ChannelClosed)?;
        self.wake();
        Ok(())
    }

    /// Non-blocking send for use inside another pipeline's poll loop;
    /// a full mailbox is reported rather than waited on.
    pub fn try_send(&self, msg: T) -> CoreResult<bool> {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.wake();
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(CoreError::ChannelClosed),
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "mailbox waker failed");
        }
    }
}

/// Receiving half of a pipeline mailbox.
pub struct Inbox<T> {
    rx: Receiver<T>,
}

impl<T> Inbox<T> {
    /// Takes the next queued message, if any. Pipelines drain their
    /// inbox in a loop after each poll wake: the waker may coalesce
    /// multiple sends into one readiness event.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::time::Duration;

    const WAKE: Token = Token(0);

    #[test]
    fn send_wakes_the_poll_and_message_arrives() {
        let poll = Poll::new().unwrap();
        let (mailbox, inbox) = mailbox::<u32>(poll.registry(), WAKE).unwrap();

        let sender = std::thread::spawn(move || mailbox.send(7).unwrap());

        let mut poll = poll;
        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKE));
        sender.join().unwrap();
        assert_eq!(inbox.try_recv(), Some(7));
        assert_eq!(inbox.try_recv(), None);
    }

    #[test]
    fn coalesced_sends_all_drain() {
        let poll = Poll::new().unwrap();
        let (mailbox, inbox) = mailbox::<u32>(poll.registry(), WAKE).unwrap();
        for i in 0..5 {
            mailbox.send(i).unwrap();
        }
        let mut got = Vec::new();
        while let Some(v) = inbox.try_recv() {
            got.push(v);
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn send_to_dropped_inbox_errors() {
        let poll = Poll::new().unwrap();
        let (mailbox, inbox) = mailbox::<u32>(poll.registry(), WAKE).unwrap();
        drop(inbox);
        assert!(matches!(mailbox.send(1), Err(CoreError::ChannelClosed)));
    }
}
