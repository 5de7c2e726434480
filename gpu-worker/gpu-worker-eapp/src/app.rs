/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use gpu_worker_abi::{cmd, ret, MatmulReport, MatmulStatus};
use thiserror::Error;

use crate::checksum::Checksum;
use crate::edge::{EdgeCaller, EdgeError, EdgeTransport};
use crate::matmul::{matrix_mul, Dims, KernelError};

pub const HELLOWORLD_MESSAGE: &[u8] = b"Hello World\0";

#[derive(Clone, Debug)]
pub struct EappConfig {
    /// Bytes the enclave may allocate for the operands and result of one
    /// matrix multiply.
    pub heap_limit: usize,
}

impl Default for EappConfig {
    fn default() -> Self {
        EappConfig { heap_limit: 64 * 1024 * 1024 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EappSummary {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum EappError {
    #[error(transparent)]
    Edge(#[from] EdgeError),
    #[error("dimension buffer is {0} bytes, expected 16")]
    CorruptDimensions(u64),
    #[error("{rows}x{cols} matrices do not fit in a {limit} byte heap")]
    MatrixTooLarge { rows: u64, cols: u64, limit: usize },
    #[error("chunk of {0} bytes is empty or misaligned")]
    BadChunk(u64),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Runs the event loop over `shared` until the host replies `EXIT`.
pub fn run<T: EdgeTransport>(shared: &mut [u8], transport: T, config: &EappConfig) -> Result<EappSummary, EdgeError> {
    let mut caller = EdgeCaller::new(shared, transport)?;
    main_loop(&mut caller, config)
}

/// Parks on the host and runs whichever workload it selects.
///
/// A failed workload does not end the loop: the enclave polls again, which
/// tells the host that the workload was abandoned. Only an edge failure on the
/// poll itself is returned.
pub fn main_loop<T: EdgeTransport>(caller: &mut EdgeCaller<'_, T>, config: &EappConfig) -> Result<EappSummary, EdgeError> {
    let mut summary = EappSummary::default();
    loop {
        let result = match caller.ocall_u64(cmd::EV_LOOP_POLL, &[])? {
            ret::EXIT => return Ok(summary),
            ret::START_HELLOWORLD => run_helloworld(caller).map(drop),
            ret::START_MATMUL => run_matmul(caller, config).map(drop),
            // EV_LOOP and unknown selectors
            _ => continue,
        };
        match result {
            Ok(()) => summary.completed += 1,
            Err(_) => summary.failed += 1,
        }
    }
}

/// Returns the length the host reports for the greeting.
pub fn run_helloworld<T: EdgeTransport>(caller: &mut EdgeCaller<'_, T>) -> Result<u64, EappError> {
    Ok(caller.ocall_u64(cmd::HELLOWORLD_PRINT_STRING, HELLOWORLD_MESSAGE)?)
}

/// Pulls both operands from the host, multiplies them and sends the report.
///
/// Errors before the report is sent are logged to the host; the report call
/// itself ends the host's session, so nothing is logged after it.
pub fn run_matmul<T: EdgeTransport>(caller: &mut EdgeCaller<'_, T>, config: &EappConfig) -> Result<MatmulStatus, EappError> {
    let report = match pull_and_multiply(caller, config) {
        Ok(report) => report,
        Err(e) => {
            let _ = enclave_log!(caller, "matmul aborted: {}", e);
            return Err(e);
        }
    };
    caller.ocall(cmd::MATMUL_COPY_REPORT, &report.to_bytes())?;
    Ok(report.status)
}

fn pull_and_multiply<T: EdgeTransport>(caller: &mut EdgeCaller<'_, T>, config: &EappConfig) -> Result<MatmulReport, EappError> {
    let desc = caller.ocall_descriptor(cmd::MATMUL_GET_DIMS, &[])?;
    if desc.size != 16 {
        return Err(EappError::CorruptDimensions(desc.size));
    }
    let mut raw = [0u8; 16];
    caller.copy_from_shared(&desc, &mut raw)?;
    let (rows, cols) = (LittleEndian::read_u64(&raw[..8]), LittleEndian::read_u64(&raw[8..]));
    let dims = checked_dims(rows, cols, config.heap_limit)?;
    let count = dims.rows * dims.cols;

    // Covers every byte received from the host, dimensions included.
    let mut input = Checksum::new();
    input.update(&raw);
    let lhs = pull_matrix(caller, count, &mut input)?;
    let rhs = pull_matrix(caller, count, &mut input)?;

    let mut out = vec![0f32; count];
    let (status, output_checksum, data) = match matrix_mul(&lhs, dims, &rhs, dims, &mut out) {
        Ok(()) => {
            let mut output = Checksum::new();
            output.update_f32(&out);
            (MatmulStatus::Completed, output.value(), out)
        }
        Err(KernelError::DimensionMismatch { .. }) => (MatmulStatus::DimensionMismatch, 0, Vec::new()),
        Err(e) => return Err(e.into()),
    };

    Ok(MatmulReport { status, input_checksum: input.value(), output_checksum, rows, cols, data })
}

/// Both operands and the result must fit the heap limit together.
fn checked_dims(rows: u64, cols: u64, heap_limit: usize) -> Result<Dims, EappError> {
    let too_large = EappError::MatrixTooLarge { rows, cols, limit: heap_limit };
    let dims = match (usize::try_from(rows), usize::try_from(cols)) {
        (Ok(r), Ok(c)) => Dims::new(r, c),
        _ => return Err(too_large),
    };
    match dims.len().and_then(|n| n.checked_mul(3 * 4)) {
        Some(bytes) if bytes <= heap_limit => Ok(dims),
        _ => Err(too_large),
    }
}

fn pull_matrix<T: EdgeTransport>(caller: &mut EdgeCaller<'_, T>, count: usize, checksum: &mut Checksum) -> Result<Vec<f32>, EappError> {
    let mut matrix = Vec::with_capacity(count);
    while matrix.len() < count {
        let desc = caller.ocall_descriptor(cmd::MATMUL_GET_CHUNK, &[])?;
        let chunk = caller.wrapped_payload(&desc)?;
        if chunk.is_empty() || chunk.len() % 4 != 0 {
            return Err(EappError::BadChunk(desc.size));
        }
        // Elements past the end of the matrix are dropped.
        let take = chunk.len().min((count - matrix.len()) * 4);
        let chunk = &chunk[..take];
        checksum.update(chunk);
        matrix.extend(chunk.chunks_exact(4).map(LittleEndian::read_f32));
    }
    Ok(matrix)
}
