/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dims {
    pub rows: usize,
    pub cols: usize,
}

impl Dims {
    pub fn new(rows: usize, cols: usize) -> Self {
        Dims { rows, cols }
    }

    pub fn len(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("cannot multiply a {lhs} matrix by a {rhs} matrix")]
    DimensionMismatch { lhs: Dims, rhs: Dims },
    #[error("buffer holds {actual} elements but {dims} needs {expected}")]
    BufferSize { dims: Dims, expected: usize, actual: usize },
}

fn check_buffer(dims: Dims, actual: usize) -> Result<(), KernelError> {
    match dims.len() {
        Some(expected) if expected == actual => Ok(()),
        expected => Err(KernelError::BufferSize { dims, expected: expected.unwrap_or(usize::MAX), actual }),
    }
}

/// Multiplies `m1` (`d1`) by `m2` (`d2`) into `out`, all row-major.
///
/// `out` must hold `d1.rows × d2.cols` elements. On error `out` is left
/// untouched.
pub fn matrix_mul(m1: &[f32], d1: Dims, m2: &[f32], d2: Dims, out: &mut [f32]) -> Result<(), KernelError> {
    if d1.cols != d2.rows {
        return Err(KernelError::DimensionMismatch { lhs: d1, rhs: d2 });
    }
    check_buffer(d1, m1.len())?;
    check_buffer(d2, m2.len())?;
    check_buffer(Dims::new(d1.rows, d2.cols), out.len())?;

    for i in 0..d1.rows {
        for j in 0..d2.cols {
            let mut acc = 0f32;
            for k in 0..d1.cols {
                acc += m1[i * d1.cols + k] * m2[k * d2.cols + j];
            }
            out[i * d2.cols + j] = acc;
        }
    }
    Ok(())
}
