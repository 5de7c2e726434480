/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Host-side halves of the workloads the enclave can run.
//!
//! A [`Workload`] only sees the calls specific to it. [`Session`] wraps it
//! with the parts every workload shares: answering the parked poll with the
//! start selector, forwarding enclave log messages, and delivering the result
//! to the request thread.

use crossbeam_channel::{bounded, Receiver, Sender};
use gpu_worker_abi::{cmd, ret};
use log::{info, warn};

use crate::router::CallDispatch;
use crate::shared_buffer::SharedBuffer;

mod helloworld;
mod matmul;

pub use self::helloworld::HelloWorld;
pub use self::matmul::Matmul;

/// What a workload did with a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Answered; more calls are expected.
    Continue,
    /// Answered; the workload is complete.
    Finished,
    /// Not meaningful in the workload's current state. Nothing was written.
    Spurious,
}

pub trait Workload: Send + 'static {
    const NAME: &'static str;
    type Output: Send + 'static;

    /// Selector the parked enclave receives to start this workload.
    fn start_selector(&self) -> u64;

    fn on_call(&mut self, call_id: u64, buf: &mut SharedBuffer<'_>) -> Step;

    fn finish(self) -> Self::Output;
}

#[derive(Debug, PartialEq)]
pub enum SessionEnd<T> {
    Completed(T),
    /// The enclave went back to polling before the workload finished.
    Abandoned,
}

pub struct Session<W: Workload> {
    workload: Option<W>,
    started: bool,
    done: Sender<SessionEnd<W::Output>>,
}

impl<W: Workload> Session<W> {
    pub fn new(workload: W) -> (Self, Receiver<SessionEnd<W::Output>>) {
        let (done, rx) = bounded(1);
        (Session { workload: Some(workload), started: false, done }, rx)
    }

    fn end(&mut self, end: SessionEnd<W::Output>) {
        self.workload = None;
        // The receiver may have given up; the session is over regardless.
        let _ = self.done.try_send(end);
    }
}

impl<W: Workload> CallDispatch for Session<W> {
    fn dispatch(&mut self, buf: &mut SharedBuffer<'_>) -> bool {
        let workload = match self.workload.as_mut() {
            Some(workload) => workload,
            None => return false,
        };

        match buf.call_id() {
            cmd::EV_LOOP_POLL if !self.started => {
                info!("starting {} workload", W::NAME);
                self.started = true;
                let _ = buf.write_scalar_return(workload.start_selector());
                true
            }
            cmd::EV_LOOP_POLL => {
                warn!("enclave abandoned the {} workload", W::NAME);
                let _ = buf.write_scalar_return(ret::EV_LOOP);
                self.end(SessionEnd::Abandoned);
                false
            }
            cmd::LOG_MSG => {
                match buf.read_c_string() {
                    Some(msg) => {
                        info!(target: "enclave", "{}", msg);
                        let _ = buf.write_scalar_return(0);
                    }
                    None => warn!("dropping malformed enclave log message"),
                }
                true
            }
            call_id => match workload.on_call(call_id, buf) {
                Step::Continue => true,
                Step::Spurious => {
                    warn!("spurious call {} during {} workload", call_id, W::NAME);
                    let _ = buf.write_scalar_return(ret::EXIT);
                    true
                }
                Step::Finished => {
                    info!("{} workload finished", W::NAME);
                    match self.workload.take() {
                        Some(workload) => self.end(SessionEnd::Completed(workload.finish())),
                        None => self.end(SessionEnd::Abandoned),
                    }
                    false
                }
            },
        }
    }
}
