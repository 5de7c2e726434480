/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::convert::TryFrom;
use std::ops::Range;

use gpu_worker_abi::layout::WRAPPED_PAYLOAD_OFFSET;
use gpu_worker_abi::{cmd, ret, MatmulJob, MatmulReport, MatmulStatus};
use gpu_worker_eapp::Checksum;
use log::{debug, error, info, warn};

use super::{Step, Workload};
use crate::shared_buffer::SharedBuffer;
use crate::HostError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operand {
    Lhs,
    Rhs,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Phase {
    /// Dimensions not yet requested.
    Start,
    Streaming { operand: Operand, cursor: usize },
    /// Both operands sent; waiting for the report.
    Exhausted,
}

/// Streams two matrices into the enclave and collects the product.
#[derive(Debug)]
pub struct Matmul {
    job: MatmulJob,
    phase: Phase,
    sent: Checksum,
    report: Option<MatmulReport>,
}

impl Matmul {
    /// Fails if the job is inconsistent or a chunk could not fit in a region
    /// of `region_len` bytes.
    pub fn new(job: MatmulJob, region_len: usize) -> Result<Self, HostError> {
        validate(&job, region_len)?;
        Ok(Matmul { job, phase: Phase::Start, sent: Checksum::new(), report: None })
    }

    fn operand(&self, operand: Operand) -> &[f32] {
        match operand {
            Operand::Lhs => &self.job.lhs,
            Operand::Rhs => &self.job.rhs,
        }
    }

    /// Advances the stream by one chunk. Chunks never straddle operands.
    fn next_chunk(&mut self) -> Option<(Operand, Range<usize>)> {
        let (operand, cursor) = match self.phase {
            Phase::Streaming { operand, cursor } => (operand, cursor),
            _ => return None,
        };
        let total = self.operand(operand).len();
        let chunk_len = usize::try_from(self.job.chunk_len).unwrap_or(usize::MAX);
        let end = cursor + chunk_len.min(total - cursor);
        self.phase = match operand {
            _ if end < total => Phase::Streaming { operand, cursor: end },
            Operand::Lhs => Phase::Streaming { operand: Operand::Rhs, cursor: 0 },
            Operand::Rhs => Phase::Exhausted,
        };
        Some((operand, cursor..end))
    }

    fn get_dims(&mut self, buf: &mut SharedBuffer<'_>) -> Step {
        let mut dims = [0u8; 16];
        dims[..8].copy_from_slice(&self.job.rows.to_le_bytes());
        dims[8..].copy_from_slice(&self.job.cols.to_le_bytes());
        if buf.write_wrapped_return(&dims).is_err() {
            return Step::Continue;
        }
        self.sent.update(&dims);
        if self.phase == Phase::Start {
            self.phase = if self.job.lhs.is_empty() {
                Phase::Exhausted
            } else {
                Phase::Streaming { operand: Operand::Lhs, cursor: 0 }
            };
        }
        Step::Continue
    }

    fn get_chunk(&mut self, buf: &mut SharedBuffer<'_>) -> Step {
        let (operand, range) = match self.next_chunk() {
            Some(chunk) => chunk,
            None => return Step::Spurious,
        };
        debug!("sending {:?} elements {}..{}", operand, range.start, range.end);
        let bytes: Vec<u8> = self.operand(operand)[range].iter().flat_map(|v| v.to_le_bytes()).collect();
        if buf.write_wrapped_return(&bytes).is_ok() {
            self.sent.update(&bytes);
        }
        Step::Continue
    }

    fn copy_report(&mut self, buf: &mut SharedBuffer<'_>) -> Step {
        let report = match buf.read_arg_bytes().map(MatmulReport::from_bytes) {
            Some(Ok(report)) => report,
            Some(Err(e)) => {
                error!("malformed matmul report: {}", e);
                let _ = buf.write_scalar_return(1);
                return Step::Finished;
            }
            None => return Step::Finished,
        };

        if self.phase != Phase::Exhausted {
            warn!("matmul report received before both operands were sent");
        }
        if report.input_checksum != self.sent.value() {
            error!(
                "input checksum mismatch: enclave computed {}, host sent {}",
                report.input_checksum,
                self.sent.value()
            );
        }
        match report.status {
            MatmulStatus::Completed => info!(
                "matmul completed: {}x{} result, output checksum {}",
                report.rows, report.cols, report.output_checksum
            ),
            MatmulStatus::DimensionMismatch => {
                warn!("enclave refused {}x{} operands: dimension mismatch", report.rows, report.cols)
            }
        }
        let _ = buf.write_scalar_return(0);
        self.report = Some(report);
        Step::Finished
    }
}

impl Workload for Matmul {
    const NAME: &'static str = "matmul";
    /// `None` if the enclave's report could not be decoded.
    type Output = Option<MatmulReport>;

    fn start_selector(&self) -> u64 {
        ret::START_MATMUL
    }

    fn on_call(&mut self, call_id: u64, buf: &mut SharedBuffer<'_>) -> Step {
        match call_id {
            cmd::MATMUL_GET_DIMS => self.get_dims(buf),
            cmd::MATMUL_GET_CHUNK => self.get_chunk(buf),
            cmd::MATMUL_COPY_REPORT => self.copy_report(buf),
            _ => Step::Spurious,
        }
    }

    fn finish(self) -> Option<MatmulReport> {
        self.report
    }
}

fn validate(job: &MatmulJob, region_len: usize) -> Result<(), HostError> {
    let elements = job
        .rows
        .checked_mul(job.cols)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| HostError::InvalidJob(format!("{}x{} matrix is too large", job.rows, job.cols)))?;
    if job.lhs.len() != elements || job.rhs.len() != elements {
        return Err(HostError::InvalidJob(format!(
            "{}x{} matrices need {} elements, got {} and {}",
            job.rows,
            job.cols,
            elements,
            job.lhs.len(),
            job.rhs.len()
        )));
    }
    if job.chunk_len == 0 {
        return Err(HostError::InvalidJob("chunk length must be positive".to_string()));
    }
    let capacity = (region_len.saturating_sub(WRAPPED_PAYLOAD_OFFSET) / 4) as u64;
    if job.chunk_len.min(elements as u64) > capacity {
        return Err(HostError::InvalidJob(format!(
            "chunks of {} elements do not fit the {} byte shared region",
            job.chunk_len, region_len
        )));
    }
    Ok(())
}
