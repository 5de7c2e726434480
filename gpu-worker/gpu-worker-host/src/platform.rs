/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::ensure;
use gpu_worker_abi::layout::WRAPPED_PAYLOAD_OFFSET;
use gpu_worker_eapp::{EappConfig, EdgeTransport};
use log::{error, info};

use crate::router::CallRouter;
use crate::shared_buffer::SharedBuffer;
use crate::HostError;

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// The three images an enclave instance is built from.
#[derive(Clone, Default)]
pub struct EnclaveImages {
    pub enclave: Vec<u8>,
    pub runtime: Vec<u8>,
    pub loader: Vec<u8>,
}

impl fmt::Debug for EnclaveImages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveImages")
            .field("enclave", &self.enclave.len())
            .field("runtime", &self.runtime.len())
            .field("loader", &self.loader.len())
            .finish()
    }
}

impl EnclaveImages {
    /// The enclave and runtime must be ELF files; the loader is a raw image.
    pub fn validate(&self) -> Result<(), HostError> {
        for (name, image) in [("enclave", &self.enclave), ("runtime", &self.runtime)] {
            if !image.starts_with(ELF_MAGIC) {
                return Err(HostError::InvalidImage(name, "not an ELF file".to_string()));
            }
        }
        if self.loader.is_empty() {
            return Err(HostError::InvalidImage("loader", "image is empty".to_string()));
        }
        Ok(())
    }
}

/// Memory configuration of an enclave instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnclaveParams {
    untrusted_mem_size: usize,
    free_mem_size: usize,
}

impl EnclaveParams {
    pub const DEFAULT_UNTRUSTED_MEM_SIZE: usize = 1024 * 1024;
    pub const DEFAULT_FREE_MEM_SIZE: usize = 64 * 1024 * 1024;

    pub fn builder() -> EnclaveParamsBuilder {
        EnclaveParamsBuilder::default()
    }

    /// Size of the shared region.
    pub fn untrusted_mem_size(&self) -> usize {
        self.untrusted_mem_size
    }

    /// Heap available to the enclave application.
    pub fn free_mem_size(&self) -> usize {
        self.free_mem_size
    }
}

impl Default for EnclaveParams {
    fn default() -> Self {
        EnclaveParams {
            untrusted_mem_size: Self::DEFAULT_UNTRUSTED_MEM_SIZE,
            free_mem_size: Self::DEFAULT_FREE_MEM_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EnclaveParamsBuilder {
    untrusted_mem_size: Option<usize>,
    free_mem_size: Option<usize>,
}

impl EnclaveParamsBuilder {
    /// Size of the shared region. Defaults to 1 MiB.
    pub fn untrusted_mem_size(&mut self, size: usize) -> &mut Self {
        self.untrusted_mem_size = Some(size);
        self
    }

    /// Heap available to the enclave application. Defaults to 64 MiB.
    pub fn free_mem_size(&mut self, size: usize) -> &mut Self {
        self.free_mem_size = Some(size);
        self
    }

    pub fn build(&self) -> Result<EnclaveParams, anyhow::Error> {
        EnclaveParams::try_from(self)
    }
}

impl TryFrom<&EnclaveParamsBuilder> for EnclaveParams {
    type Error = anyhow::Error;

    fn try_from(builder: &EnclaveParamsBuilder) -> Result<Self, Self::Error> {
        let untrusted_mem_size = builder.untrusted_mem_size.unwrap_or(Self::DEFAULT_UNTRUSTED_MEM_SIZE);
        let free_mem_size = builder.free_mem_size.unwrap_or(Self::DEFAULT_FREE_MEM_SIZE);
        ensure!(
            untrusted_mem_size >= WRAPPED_PAYLOAD_OFFSET + 16,
            "untrusted memory of {} bytes cannot hold a call record and a dimension reply",
            untrusted_mem_size
        );
        ensure!(free_mem_size > 0, "free memory size must be positive");
        Ok(EnclaveParams { untrusted_mem_size, free_mem_size })
    }
}

/// A way of running the enclave application.
pub trait EnclavePlatform: Send + Sync {
    /// Starts an enclave whose edge calls are answered by `router`.
    fn launch(&self, images: &EnclaveImages, params: &EnclaveParams, router: Arc<CallRouter>) -> Result<RunningEnclave, HostError>;
}

/// Handle to a launched enclave. Dropping it closes the router and waits for
/// the enclave thread to exit.
#[derive(Debug)]
pub struct RunningEnclave {
    router: Arc<CallRouter>,
    thread: Option<JoinHandle<()>>,
}

impl RunningEnclave {
    pub fn new(router: Arc<CallRouter>, thread: JoinHandle<()>) -> Self {
        RunningEnclave { router, thread: Some(thread) }
    }

    pub fn router(&self) -> &CallRouter {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        !self.router.is_closed()
    }
}

impl Drop for RunningEnclave {
    fn drop(&mut self) {
        self.router.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("enclave thread panicked");
            }
        }
    }
}

/// Runs the enclave application natively on a host thread. Edge calls still
/// go through a byte-level shared region.
#[derive(Clone, Copy, Debug, Default)]
pub struct Simulator;

struct RouterTransport {
    router: Arc<CallRouter>,
}

impl EdgeTransport for RouterTransport {
    fn edge_call(&mut self, shared: &mut [u8]) {
        match SharedBuffer::new(shared) {
            Ok(mut buf) => {
                self.router.on_call(&mut buf);
            }
            Err(e) => error!("dropping edge call: {}", e),
        }
    }
}

/// Closes the router however the enclave thread exits.
struct CloseOnExit(Arc<CallRouter>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl EnclavePlatform for Simulator {
    fn launch(&self, images: &EnclaveImages, params: &EnclaveParams, router: Arc<CallRouter>) -> Result<RunningEnclave, HostError> {
        images.validate()?;
        let region_len = params.untrusted_mem_size();
        if region_len < WRAPPED_PAYLOAD_OFFSET {
            return Err(HostError::RegionTooSmall(region_len));
        }
        let config = EappConfig { heap_limit: params.free_mem_size() };
        let thread_router = router.clone();

        let thread = thread::Builder::new().name("enclave".to_string()).spawn(move || {
            let _close = CloseOnExit(thread_router.clone());
            let mut region = vec![0u8; region_len];
            let transport = RouterTransport { router: thread_router };
            match gpu_worker_eapp::run(&mut region, transport, &config) {
                Ok(summary) => info!(
                    "enclave exited: {} workloads completed, {} failed",
                    summary.completed, summary.failed
                ),
                Err(e) => error!("enclave exited: {}", e),
            }
        })?;
        info!("launched simulated enclave with a {} byte shared region", region_len);
        Ok(RunningEnclave::new(router, thread))
    }
}
