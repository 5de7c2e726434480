/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Result of a matrix multiply, as copied out of the enclave with
//! [`cmd::MATMUL_COPY_REPORT`](crate::cmd::MATMUL_COPY_REPORT).
//!
//! Wire format, all fields little-endian:
//!
//! ```text
//! status: u64 | input_checksum: u64 | output_checksum: u64 |
//! rows: u64 | cols: u64 | count: u64 | count × f32
//! ```

use alloc::vec::Vec;
use core::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::layout::LayoutError;

const HEADER_SIZE: usize = 6 * 8;

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatmulStatus {
    Completed = 0,
    /// The kernel refused the operands; no output was produced.
    DimensionMismatch = 1,
}

impl MatmulStatus {
    pub fn from_raw(raw: u64) -> Option<MatmulStatus> {
        match raw {
            0 => Some(MatmulStatus::Completed),
            1 => Some(MatmulStatus::DimensionMismatch),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatmulReport {
    pub status: MatmulStatus,
    /// Popcount over the bytes of both input matrices as received.
    pub input_checksum: u64,
    /// Popcount over the bytes of the output matrix; 0 if none was produced.
    pub output_checksum: u64,
    pub rows: u64,
    pub cols: u64,
    pub data: Vec<f32>,
}

impl MatmulReport {
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.data.len() * 4
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = alloc::vec![0u8; self.encoded_len()];
        let header = [
            self.status as u64,
            self.input_checksum,
            self.output_checksum,
            self.rows,
            self.cols,
            self.data.len() as u64,
        ];
        LittleEndian::write_u64_into(&header, &mut out[..HEADER_SIZE]);
        LittleEndian::write_f32_into(&self.data, &mut out[HEADER_SIZE..]);
        out
    }

    /// Decodes a report, rejecting any whose element count is inconsistent
    /// with its status and shape.
    pub fn from_bytes(buf: &[u8]) -> Result<MatmulReport, ReportError> {
        if buf.len() < HEADER_SIZE {
            return Err(LayoutError::BufferTooSmall { needed: HEADER_SIZE, actual: buf.len() }.into());
        }
        let mut header = [0u64; 6];
        LittleEndian::read_u64_into(&buf[..HEADER_SIZE], &mut header);
        let [status, input_checksum, output_checksum, rows, cols, count] = header;

        let status = MatmulStatus::from_raw(status).ok_or(ReportError::UnknownStatus(status))?;
        let expected = match status {
            MatmulStatus::Completed => rows.checked_mul(cols),
            MatmulStatus::DimensionMismatch => Some(0),
        };
        if expected != Some(count) {
            return Err(ReportError::CountMismatch { rows, cols, count });
        }

        let payload = &buf[HEADER_SIZE..];
        let needed = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(4))
            .ok_or(ReportError::CountMismatch { rows, cols, count })?;
        if payload.len() != needed {
            return Err(LayoutError::BufferTooSmall { needed: HEADER_SIZE + needed, actual: buf.len() }.into());
        }
        let mut data = alloc::vec![0f32; needed / 4];
        LittleEndian::read_f32_into(payload, &mut data);

        Ok(MatmulReport { status, input_checksum, output_checksum, rows, cols, data })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportError {
    Layout(LayoutError),
    UnknownStatus(u64),
    CountMismatch { rows: u64, cols: u64, count: u64 },
}

impl From<LayoutError> for ReportError {
    fn from(e: LayoutError) -> Self {
        ReportError::Layout(e)
    }
}

impl core::fmt::Display for ReportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ReportError::Layout(e) => write!(f, "malformed report: {}", e),
            ReportError::UnknownStatus(s) => write!(f, "unknown report status {}", s),
            ReportError::CountMismatch { rows, cols, count } => {
                write!(f, "report carries {} elements for a {}x{} result", count, rows, cols)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ReportError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    fn completed() -> MatmulReport {
        MatmulReport {
            status: MatmulStatus::Completed,
            input_checksum: 7,
            output_checksum: 9,
            rows: 2,
            cols: 2,
            data: vec![19.0, 22.0, 43.0, 50.0],
        }
    }

    #[test]
    fn encode_layout() {
        let bytes = completed().to_bytes();
        assert_eq!(bytes.len(), 48 + 16);
        assert_eq!(&bytes[0..8], &[0u8; 8]);
        assert_eq!(bytes[8], 7);
        assert_eq!(bytes[40], 4);
        assert_eq!(&bytes[48..52], &19.0f32.to_le_bytes());
        assert_eq!(MatmulReport::from_bytes(&bytes).unwrap(), completed());
    }

    #[test]
    fn mismatch_carries_no_data() {
        let report = MatmulReport {
            status: MatmulStatus::DimensionMismatch,
            input_checksum: 3,
            output_checksum: 0,
            rows: 2,
            cols: 3,
            data: vec![],
        };
        let bytes = report.to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(MatmulReport::from_bytes(&bytes).unwrap(), report);
    }

    #[test]
    fn inconsistent_reports_are_rejected() {
        let mut short = completed();
        short.data.pop();
        assert_eq!(
            MatmulReport::from_bytes(&short.to_bytes()),
            Err(ReportError::CountMismatch { rows: 2, cols: 2, count: 3 })
        );

        let mut bytes = completed().to_bytes();
        bytes[0] = 5;
        assert_eq!(MatmulReport::from_bytes(&bytes), Err(ReportError::UnknownStatus(5)));

        let bytes = completed().to_bytes();
        assert!(MatmulReport::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(MatmulReport::from_bytes(&bytes[..20]).is_err());
    }
}
