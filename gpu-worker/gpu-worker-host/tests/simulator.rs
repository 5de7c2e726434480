/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! End-to-end runs of the enclave application on the simulator.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use gpu_worker_abi::{cmd, ret, MatmulJob, MatmulStatus};
use gpu_worker_eapp::{Checksum, EdgeCaller};
use gpu_worker_host::workloads::{SessionEnd, Step, Workload};
use gpu_worker_host::{
    CallOutcome, CallRouter, EnclaveImages, EnclaveParams, EnclaveRegistry, HostError, SharedBuffer, Simulator,
};

fn images() -> EnclaveImages {
    EnclaveImages {
        enclave: b"\x7fELF\x02\x01\x01".to_vec(),
        runtime: b"\x7fELF\x02\x01\x01".to_vec(),
        loader: vec![0x6f, 0x00, 0x00, 0x00],
    }
}

fn bootstrapped() -> EnclaveRegistry {
    let registry = EnclaveRegistry::new(Box::new(Simulator), EnclaveParams::default());
    registry.bootstrap(&images()).unwrap();
    registry
}

#[test]
fn helloworld() {
    let registry = bootstrapped();
    assert_eq!(registry.run_helloworld().unwrap().as_deref(), Some("Hello World"));
    // The enclave parks again after every workload.
    assert_eq!(registry.run_helloworld().unwrap().as_deref(), Some("Hello World"));
}

#[test]
fn parked_enclave_stays_available() {
    let registry = bootstrapped();
    thread::sleep(Duration::from_millis(100));
    assert!(registry.is_bootstrapped());
    assert!(registry.run_helloworld().is_ok());
}

#[test]
fn matmul_scenario() {
    let registry = bootstrapped();
    let job = MatmulJob {
        rows: 2,
        cols: 2,
        lhs: vec![1., 2., 3., 4.],
        rhs: vec![5., 6., 7., 8.],
        chunk_len: 3,
    };
    let report = registry.run_matmul(Some(job)).unwrap().unwrap();
    assert_eq!(report.status, MatmulStatus::Completed);
    assert_eq!((report.rows, report.cols), (2, 2));
    assert_eq!(report.data, vec![19., 22., 43., 50.]);

    // Every byte the enclave received: the dimensions, then both operands.
    let mut input = Checksum::new();
    input.update(&2u64.to_le_bytes());
    input.update(&2u64.to_le_bytes());
    input.update_f32(&[1., 2., 3., 4., 5., 6., 7., 8.]);
    assert_eq!(report.input_checksum, input.value());
}

#[test]
fn matmul_default_job() {
    let registry = bootstrapped();
    let report = registry.run_matmul(None).unwrap().unwrap();
    assert_eq!(report.status, MatmulStatus::Completed);
    let expected = [0.6f32 * 0.6 + 1., 0.6 + 1., 0.6 + 1., 2.];
    for (got, want) in report.data.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-6, "{} != {}", got, want);
    }
}

#[test]
fn matmul_dimension_mismatch() {
    let registry = bootstrapped();
    let job = MatmulJob { rows: 2, cols: 3, lhs: vec![1.; 6], rhs: vec![2.; 6], chunk_len: 4 };
    let report = registry.run_matmul(Some(job)).unwrap().unwrap();
    assert_eq!(report.status, MatmulStatus::DimensionMismatch);
    assert!(report.data.is_empty());
    // The enclave survives and takes more work.
    assert!(registry.run_helloworld().is_ok());
}

#[test]
fn invalid_job_is_not_installed() {
    let registry = bootstrapped();
    let job = MatmulJob { rows: 2, cols: 2, lhs: vec![1.; 4], rhs: vec![1.; 3], chunk_len: 4 };
    assert!(matches!(registry.run_matmul(Some(job)), Err(HostError::InvalidJob(_))));
    assert!(registry.run_helloworld().is_ok());
}

#[test]
fn heap_limit_is_enforced() {
    let params = EnclaveParams::builder().free_mem_size(32).build().unwrap();
    let registry = EnclaveRegistry::new(Box::new(Simulator), params);
    registry.bootstrap(&images()).unwrap();
    // 2x2 needs 48 bytes for both operands and the result.
    assert!(matches!(registry.run_matmul(None), Err(HostError::WorkloadAbandoned("matmul"))));
    assert!(registry.run_helloworld().is_ok());
}

/// Replies to the dimension request with a truncated buffer.
struct CorruptDims;

impl Workload for CorruptDims {
    const NAME: &'static str = "corrupt-dims";
    type Output = ();

    fn start_selector(&self) -> u64 {
        ret::START_MATMUL
    }

    fn on_call(&mut self, call_id: u64, buf: &mut SharedBuffer<'_>) -> Step {
        match call_id {
            cmd::MATMUL_GET_DIMS => {
                buf.write_wrapped_return(&2u64.to_le_bytes()).unwrap();
                Step::Continue
            }
            _ => Step::Spurious,
        }
    }

    fn finish(self) {}
}

#[test]
fn abandoned_workload_parks_enclave_again() {
    let registry = bootstrapped();
    assert_eq!(registry.run_workload(CorruptDims).unwrap(), SessionEnd::Abandoned);
    assert_eq!(registry.run_helloworld().unwrap().as_deref(), Some("Hello World"));
}

#[test]
fn concurrent_requests_are_serialized() {
    let registry = Arc::new(bootstrapped());
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            thread::spawn(move || {
                if i % 2 == 0 {
                    registry.run_helloworld().map(|_| ())
                } else {
                    registry.run_matmul(None).map(|_| ())
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }
}

#[test]
fn teardown_wakes_parked_enclave() {
    let registry = bootstrapped();
    thread::sleep(Duration::from_millis(50));
    assert!(registry.teardown());
    assert!(!registry.is_bootstrapped());
    assert!(matches!(registry.run_helloworld(), Err(HostError::NotBootstrapped)));
    registry.bootstrap(&images()).unwrap();
    assert!(registry.run_helloworld().is_ok());
}

fn exit_handler(buf: &mut SharedBuffer<'_>) -> bool {
    buf.write_scalar_return(ret::EXIT).unwrap();
    false
}

#[test]
fn protocol_violation_is_survivable() {
    let router = Arc::new(CallRouter::new());
    let (strayed, stray_done) = mpsc::channel();
    let enclave = {
        let router = router.clone();
        thread::spawn(move || {
            let mut region = vec![0u8; 4096];
            let mut outcomes = Vec::new();
            let mut caller = EdgeCaller::new(&mut region, |shared: &mut [u8]| {
                outcomes.push(router.on_call(&mut SharedBuffer::new(shared).unwrap()));
            })
            .unwrap();
            let stray = caller.ocall_u64(cmd::MATMUL_GET_CHUNK, &[]).unwrap();
            strayed.send(()).unwrap();
            let selector = caller.ocall_u64(cmd::EV_LOOP_POLL, &[]).unwrap();
            drop(caller);
            (stray, selector, outcomes)
        })
    };

    stray_done.recv().unwrap();
    let ticket = router.install(Box::new(exit_handler)).unwrap();
    router.await_completion(ticket).unwrap();

    let (stray, selector, outcomes) = enclave.join().unwrap();
    assert_eq!(stray, ret::EXIT);
    assert_eq!(selector, ret::EXIT);
    assert_eq!(
        outcomes,
        vec![CallOutcome::ProtocolViolation(cmd::MATMUL_GET_CHUNK), CallOutcome::Dispatched { finished: true }]
    );
}
