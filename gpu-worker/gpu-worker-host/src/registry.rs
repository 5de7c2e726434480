/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gpu_worker_abi::{MatmulJob, MatmulReport};
use log::{info, warn};

use crate::platform::{EnclaveImages, EnclaveParams, EnclavePlatform, RunningEnclave};
use crate::router::CallRouter;
use crate::workloads::{HelloWorld, Matmul, Session, SessionEnd, Workload};
use crate::HostError;

/// Owns the (at most one) live enclave instance and runs workloads on it.
pub struct EnclaveRegistry {
    platform: Box<dyn EnclavePlatform>,
    params: EnclaveParams,
    default_job: MatmulJob,
    instance: Mutex<Option<Arc<RunningEnclave>>>,
}

impl EnclaveRegistry {
    pub fn new(platform: Box<dyn EnclavePlatform>, params: EnclaveParams) -> Self {
        EnclaveRegistry {
            platform,
            params,
            default_job: MatmulJob::demo(),
            instance: Mutex::new(None),
        }
    }

    /// The job run when a matmul request does not carry one.
    pub fn with_default_job(mut self, job: MatmulJob) -> Self {
        self.default_job = job;
        self
    }

    pub fn params(&self) -> &EnclaveParams {
        &self.params
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<RunningEnclave>>> {
        self.instance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.lock().as_ref().map_or(false, |enclave| enclave.is_running())
    }

    /// Launches the enclave instance. Fails with `BootstrapConflict` while a
    /// live instance exists; an instance whose enclave has exited is
    /// replaced.
    pub fn bootstrap(&self, images: &EnclaveImages) -> Result<(), HostError> {
        let mut instance = self.lock();
        if let Some(existing) = instance.as_ref() {
            if existing.is_running() {
                return Err(HostError::BootstrapConflict);
            }
            info!("replacing exited enclave instance");
        }
        let router = Arc::new(CallRouter::new());
        let enclave = self.platform.launch(images, &self.params, router)?;
        *instance = Some(Arc::new(enclave));
        info!("enclave bootstrapped ({:?})", images);
        Ok(())
    }

    fn instance(&self) -> Result<Arc<RunningEnclave>, HostError> {
        self.lock().clone().ok_or(HostError::NotBootstrapped)
    }

    /// Installs `workload` once the enclave is free and waits for its session
    /// to end.
    pub fn run_workload<W: Workload>(&self, workload: W) -> Result<SessionEnd<W::Output>, HostError> {
        let enclave = self.instance()?;
        let router = enclave.router();
        let (session, done) = Session::new(workload);
        let ticket = router.install(Box::new(session))?;
        router.await_completion(ticket)?;
        done.try_recv().map_err(|_| HostError::SessionLost)
    }

    /// Returns the string the enclave printed.
    pub fn run_helloworld(&self) -> Result<Option<String>, HostError> {
        match self.run_workload(HelloWorld::new())? {
            SessionEnd::Completed(message) => Ok(message),
            SessionEnd::Abandoned => Err(HostError::WorkloadAbandoned(HelloWorld::NAME)),
        }
    }

    /// Runs `job`, or the default job, and returns the enclave's report.
    pub fn run_matmul(&self, job: Option<MatmulJob>) -> Result<Option<MatmulReport>, HostError> {
        let job = job.unwrap_or_else(|| self.default_job.clone());
        let matmul = Matmul::new(job, self.params.untrusted_mem_size())?;
        match self.run_workload(matmul)? {
            SessionEnd::Completed(report) => Ok(report),
            SessionEnd::Abandoned => Err(HostError::WorkloadAbandoned(Matmul::NAME)),
        }
    }

    /// Stops the enclave instance, if any. Returns whether there was one.
    pub fn teardown(&self) -> bool {
        let enclave = self.lock().take();
        match enclave {
            Some(enclave) => {
                enclave.router().close();
                info!("enclave torn down");
                true
            }
            None => {
                warn!("teardown requested without an enclave instance");
                false
            }
        }
    }
}
