/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Rendezvous between the enclave thread and request threads.
//!
//! The router is Idle when no handler is installed and Active otherwise. The
//! enclave thread calls [`CallRouter::on_call`] for every edge call; while
//! Idle, an [`EV_LOOP_POLL`](cmd::EV_LOOP_POLL) parks it on the condition
//! variable until a request thread [`install`](CallRouter::install)s a
//! handler. The installed handler then answers every call, starting with the
//! poll that was parked, until it reports that its session is over.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use gpu_worker_abi::{cmd, ret};
use log::{debug, error};

use crate::shared_buffer::SharedBuffer;
use crate::HostError;

/// Handles the edge calls of one workload session.
pub trait CallDispatch: Send {
    /// Answers one call. Returns `false` once the session is over, after
    /// which the handler is dropped and the router returns to Idle.
    fn dispatch(&mut self, buf: &mut SharedBuffer<'_>) -> bool;
}

impl<F> CallDispatch for F
where
    F: FnMut(&mut SharedBuffer<'_>) -> bool + Send,
{
    fn dispatch(&mut self, buf: &mut SharedBuffer<'_>) -> bool {
        self(buf)
    }
}

/// Identifies an installed session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

#[derive(Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// The installed handler answered the call.
    Dispatched { finished: bool },
    /// The router is closed; the enclave was told to exit.
    Closed,
    /// A non-poll call arrived while Idle; the enclave was told to exit.
    ProtocolViolation(u64),
}

#[derive(Default)]
struct Slot {
    handler: Option<Box<dyn CallDispatch>>,
    installed: u64,
    finished: u64,
    closed: bool,
}

#[derive(Default)]
pub struct CallRouter {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl fmt::Debug for CallRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("CallRouter")
            .field("active", &slot.handler.is_some())
            .field("installed", &slot.installed)
            .field("finished", &slot.finished)
            .field("closed", &slot.closed)
            .finish()
    }
}

impl CallRouter {
    pub fn new() -> Self {
        Default::default()
    }

    // Slot updates are single assignments, so a poisoned lock is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, slot: MutexGuard<'a, Slot>) -> MutexGuard<'a, Slot> {
        self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `handler`, blocking while another session is active.
    pub fn install(&self, handler: Box<dyn CallDispatch>) -> Result<Ticket, HostError> {
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return Err(HostError::EnclaveExited);
            }
            if slot.handler.is_none() {
                break;
            }
            slot = self.wait(slot);
        }
        slot.handler = Some(handler);
        slot.installed += 1;
        let ticket = Ticket(slot.installed);
        debug!("installed session {}", ticket.0);
        self.cond.notify_all();
        Ok(ticket)
    }

    /// Blocks until no session is active.
    pub fn await_idle(&self) {
        let mut slot = self.lock();
        while slot.handler.is_some() && !slot.closed {
            slot = self.wait(slot);
        }
    }

    /// Blocks until the session identified by `ticket` has finished.
    pub fn await_completion(&self, ticket: Ticket) -> Result<(), HostError> {
        let mut slot = self.lock();
        loop {
            if slot.finished >= ticket.0 {
                return Ok(());
            }
            if slot.closed {
                return Err(HostError::EnclaveExited);
            }
            slot = self.wait(slot);
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Ends the router's life. Any installed handler is dropped without
    /// finishing; a parked enclave is woken and told to exit.
    pub fn close(&self) {
        let mut slot = self.lock();
        if !slot.closed {
            debug!("closing call router");
        }
        slot.closed = true;
        slot.handler = None;
        self.cond.notify_all();
    }

    /// Entry point for every edge call made by the enclave.
    pub fn on_call(&self, buf: &mut SharedBuffer<'_>) -> CallOutcome {
        let call_id = buf.call_id();
        debug!("edge call {}", call_id);

        let mut slot = self.lock();
        loop {
            if let Some(handler) = slot.handler.as_mut() {
                if handler.dispatch(buf) {
                    return CallOutcome::Dispatched { finished: false };
                }
                slot.handler = None;
                slot.finished += 1;
                debug!("session {} finished", slot.finished);
                self.cond.notify_all();
                return CallOutcome::Dispatched { finished: true };
            }
            if slot.closed {
                let _ = buf.write_scalar_return(ret::EXIT);
                return CallOutcome::Closed;
            }
            if call_id != cmd::EV_LOOP_POLL {
                error!("protocol violation: call {} while no workload is running", call_id);
                let _ = buf.write_scalar_return(ret::EXIT);
                return CallOutcome::ProtocolViolation(call_id);
            }
            slot = self.wait(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_worker_abi::CallRecord;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn call(router: &CallRouter, call_id: u64) -> (CallOutcome, CallRecord, u64) {
        let mut region = vec![0u8; 128];
        CallRecord { call_id, ..Default::default() }.write_to(&mut region).unwrap();
        let outcome = router.on_call(&mut SharedBuffer::new(&mut region).unwrap());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&region[48..56]);
        (outcome, CallRecord::read_from(&region).unwrap(), u64::from_le_bytes(raw))
    }

    fn boxed<F>(f: F) -> Box<dyn CallDispatch>
    where
        F: FnMut(&mut SharedBuffer<'_>) -> bool + Send + 'static,
    {
        Box::new(f)
    }

    fn reply_with(value: u64, turns: usize) -> Box<dyn CallDispatch> {
        let mut left = turns;
        boxed(move |buf| {
            buf.write_scalar_return(value).unwrap();
            left -= 1;
            left > 0
        })
    }

    #[test]
    fn idle_non_poll_is_a_protocol_violation() {
        let router = CallRouter::new();
        let (outcome, record, value) = call(&router, 100);
        assert_eq!(outcome, CallOutcome::ProtocolViolation(100));
        assert_eq!((record.status, value), (0, ret::EXIT));
        assert!(!router.is_active());
        assert!(!router.is_closed());
    }

    #[test]
    fn parked_poll_is_answered_by_installed_handler() {
        let router = Arc::new(CallRouter::new());
        let enclave = {
            let router = router.clone();
            thread::spawn(move || call(&router, cmd::EV_LOOP_POLL))
        };
        thread::sleep(Duration::from_millis(50));
        let ticket = router.install(reply_with(ret::START_HELLOWORLD, 1)).unwrap();
        router.await_completion(ticket).unwrap();

        let (outcome, _, value) = enclave.join().unwrap();
        assert_eq!(outcome, CallOutcome::Dispatched { finished: true });
        assert_eq!(value, ret::START_HELLOWORLD);
        assert!(!router.is_active());
    }

    #[test]
    fn install_is_exclusive() {
        let router = Arc::new(CallRouter::new());
        let first = router.install(reply_with(1, 2)).unwrap();

        let (tx, rx) = mpsc::channel();
        let second = {
            let router = router.clone();
            thread::spawn(move || {
                let ticket = router.install(reply_with(2, 1)).unwrap();
                tx.send(ticket).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        assert_eq!(call(&router, 7).0, CallOutcome::Dispatched { finished: false });
        assert!(rx.try_recv().is_err());
        assert_eq!(call(&router, 7).0, CallOutcome::Dispatched { finished: true });
        router.await_completion(first).unwrap();

        second.join().unwrap();
        let ticket = rx.recv().unwrap();
        assert!(ticket > first);
        assert_eq!(call(&router, 7).2, 2);
        router.await_completion(ticket).unwrap();
        router.await_idle();
    }

    #[test]
    fn close_wakes_everyone() {
        let router = Arc::new(CallRouter::new());
        let enclave = {
            let router = router.clone();
            thread::spawn(move || call(&router, cmd::EV_LOOP_POLL))
        };
        thread::sleep(Duration::from_millis(50));
        router.close();

        let (outcome, _, value) = enclave.join().unwrap();
        assert_eq!(outcome, CallOutcome::Closed);
        assert_eq!(value, ret::EXIT);
        assert!(matches!(router.install(reply_with(1, 1)), Err(HostError::EnclaveExited)));
    }

    #[test]
    fn close_fails_pending_completion() {
        let router = Arc::new(CallRouter::new());
        let ticket = router.install(reply_with(1, 1)).unwrap();
        let waiter = {
            let router = router.clone();
            thread::spawn(move || router.await_completion(ticket))
        };
        thread::sleep(Duration::from_millis(50));
        router.close();
        assert!(matches!(waiter.join().unwrap(), Err(HostError::EnclaveExited)));
        assert!(!router.is_active());
        router.await_idle();
    }
}
