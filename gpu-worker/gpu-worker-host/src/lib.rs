/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Host side of the gpu-worker.
//!
//! The host never initiates an edge call. The enclave thread parks in
//! [`CallRouter::on_call`] waiting for work; request threads install a
//! workload [`Session`](workloads::Session) through the
//! [`EnclaveRegistry`], which the enclave then drives to completion.

use std::io;

use thiserror::Error;

pub mod platform;
pub mod registry;
pub mod router;
pub mod server;
pub mod shared_buffer;
pub mod workloads;

pub use crate::platform::{EnclaveImages, EnclaveParams, EnclavePlatform, RunningEnclave, Simulator};
pub use crate::registry::EnclaveRegistry;
pub use crate::router::{CallDispatch, CallOutcome, CallRouter, Ticket};
pub use crate::server::Server;
pub use crate::shared_buffer::{BoundaryViolation, SharedBuffer, Span};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("an enclave instance is already running")]
    BootstrapConflict,
    #[error("no enclave instance has been bootstrapped")]
    NotBootstrapped,
    #[error("the enclave has exited")]
    EnclaveExited,
    #[error("shared region of {0} bytes cannot hold a call record")]
    RegionTooSmall(usize),
    #[error("invalid {0} image: {1}")]
    InvalidImage(&'static str, String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("the enclave abandoned the {0} workload")]
    WorkloadAbandoned(&'static str),
    #[error("workload session ended without a result")]
    SessionLost,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(CallRouter: Send, Sync);
    static_assertions::assert_impl_all!(EnclaveRegistry: Send, Sync);
    static_assertions::assert_impl_all!(HostError: Send, Sync);
    static_assertions::assert_not_impl_any!(Span: Clone, Copy);
}
