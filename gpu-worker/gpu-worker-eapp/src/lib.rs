/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The enclave application of the gpu-worker.
//!
//! The enclave owns the shared region and drives every interaction: it parks
//! on the host with [`cmd::EV_LOOP_POLL`](gpu_worker_abi::cmd::EV_LOOP_POLL),
//! is told which workload to run, and then pulls its inputs through further
//! edge calls. How the region actually reaches the host is abstracted by
//! [`EdgeTransport`].

#[macro_use]
pub mod logging;
mod app;
mod checksum;
mod edge;
mod matmul;

pub use crate::app::{main_loop, run, run_helloworld, run_matmul, EappConfig, EappError, EappSummary};
pub use crate::checksum::Checksum;
pub use crate::edge::{EdgeCaller, EdgeError, EdgeTransport};
pub use crate::matmul::{matrix_mul, Dims, KernelError};
