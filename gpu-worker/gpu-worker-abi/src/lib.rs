/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Interface shared between the gpu-worker host, the enclave application and
//! remote clients.
//!
//! There are two independent protocols in this crate:
//!
//! 1. The *edge call* protocol spoken over the shared memory region between
//!    the host and the enclave (see [`layout`]). The enclave only ever hands
//!    the host integers; every address is an offset into the region and must
//!    be validated with [`layout::checked_range`] before use.
//! 2. The *request* protocol spoken between remote clients and the host
//!    ([`Request`] / [`Response`]), which selects a workload and drives it to
//!    completion.
#![no_std]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

pub mod layout;
pub mod report;
#[cfg(feature = "std")]
mod client;

pub use crate::layout::{CallRecord, CallStatus, LayoutError, WrappedReturnDescriptor};
pub use crate::report::{MatmulReport, MatmulStatus, ReportError};
#[cfg(feature = "std")]
pub use crate::client::{read_message, write_message, Client};

/// Default port of the host's RPC server.
pub const SERVER_PORT: u16 = 5826;

/// Call identifiers the enclave places in [`CallRecord::call_id`].
///
/// The namespace is flat and unversioned. Workload opcodes overlap
/// numerically: they are interpreted by whichever workload is currently
/// driving the enclave.
pub mod cmd {
    /// Park the enclave until the host has work for it. The reply is one of
    /// the [`ret`](super::ret) selectors.
    pub const EV_LOOP_POLL: u64 = 1;
    /// NUL-terminated diagnostic message from the enclave.
    pub const LOG_MSG: u64 = 2;

    pub const HELLOWORLD_PRINT_STRING: u64 = 100;

    pub const MATMUL_GET_DIMS: u64 = 100;
    pub const MATMUL_GET_CHUNK: u64 = 101;
    pub const MATMUL_COPY_REPORT: u64 = 102;
}

/// Selectors returned as the scalar reply to [`cmd::EV_LOOP_POLL`].
pub mod ret {
    pub const EXIT: u64 = 0;
    pub const EV_LOOP: u64 = 1;
    pub const START_HELLOWORLD: u64 = 2;
    pub const START_MATMUL: u64 = 3;
}

/// Input matrices for one matrix multiply workload.
///
/// Both matrices share the announced `rows × cols` shape and are streamed
/// row-major, left matrix first, `chunk_len` elements per chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatmulJob {
    pub rows: u64,
    pub cols: u64,
    pub lhs: Vec<f32>,
    pub rhs: Vec<f32>,
    pub chunk_len: u64,
}

impl MatmulJob {
    /// The 2×2 job the host serves when a client does not supply one.
    pub fn demo() -> Self {
        let m = alloc::vec![0.6, 1.0, 1.0, 1.0];
        MatmulJob {
            rows: 2,
            cols: 2,
            lhs: m.clone(),
            rhs: m,
            chunk_len: 4,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Create the enclave instance from its three images.
    Bootstrap {
        enclave: Vec<u8>,
        runtime: Vec<u8>,
        loader: Vec<u8>,
    },
    HelloWorld,
    Matmul {
        /// `None` runs the host's configured default job
        job: Option<MatmulJob>,
    },
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// `false` if an instance already exists
    Bootstrapped(bool),
    /// `false` if no instance is running
    HelloWorld(bool),
    Matmul {
        completed: bool,
        report: Option<MatmulReport>,
    },
}
