/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};
use gpu_worker_abi::layout::{self, checked_range, DATA_OFFSET};
use gpu_worker_abi::{CallRecord, CallStatus, WrappedReturnDescriptor};
use thiserror::Error;

/// Hands the shared region to the host and returns once the host has
/// written its reply.
pub trait EdgeTransport {
    fn edge_call(&mut self, shared: &mut [u8]);
}

impl<F: FnMut(&mut [u8])> EdgeTransport for F {
    fn edge_call(&mut self, shared: &mut [u8]) {
        self(shared)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EdgeError {
    #[error("shared region of {0} bytes cannot hold a call record")]
    RegionTooSmall(usize),
    #[error("{0} argument bytes do not fit in the shared region")]
    ArgsTooLarge(usize),
    #[error("host completed the call with status {0}")]
    BadStatus(u64),
    #[error("host returned out of bounds range {offset:#x}+{len}")]
    ReturnOutOfBounds { offset: u64, len: u64 },
    #[error("host returned {actual} bytes, expected {expected}")]
    ShortReturn { expected: usize, actual: usize },
}

/// Issues edge calls over a shared region.
///
/// Arguments are always placed at [`DATA_OFFSET`]. Nothing the host writes
/// back is trusted: return ranges are validated with the same rule the host
/// applies to enclave offsets.
pub struct EdgeCaller<'a, T> {
    shared: &'a mut [u8],
    transport: T,
}

impl<'a, T: EdgeTransport> EdgeCaller<'a, T> {
    pub fn new(shared: &'a mut [u8], transport: T) -> Result<Self, EdgeError> {
        if shared.len() < DATA_OFFSET {
            return Err(EdgeError::RegionTooSmall(shared.len()));
        }
        Ok(EdgeCaller { shared, transport })
    }

    /// Performs one call and returns the validated range of the reply.
    pub fn ocall(&mut self, call_id: u64, args: &[u8]) -> Result<Range<usize>, EdgeError> {
        let len = self.shared.len();
        let arg_range = checked_range(DATA_OFFSET as u64, args.len() as u64, len)
            .ok_or(EdgeError::ArgsTooLarge(args.len()))?;
        self.shared[arg_range].copy_from_slice(args);

        let record = CallRecord {
            call_id,
            arg_offset: DATA_OFFSET as u64,
            arg_len: args.len() as u64,
            status: CallStatus::Ok as u64,
            ret_offset: 0,
            ret_len: 0,
        };
        record.write_to(self.shared).map_err(|_| EdgeError::RegionTooSmall(len))?;

        self.transport.edge_call(self.shared);

        let record = CallRecord::read_from(self.shared).map_err(|_| EdgeError::RegionTooSmall(len))?;
        if record.call_status() != Some(CallStatus::Ok) {
            return Err(EdgeError::BadStatus(record.status));
        }
        checked_range(record.ret_offset, record.ret_len, len).ok_or(EdgeError::ReturnOutOfBounds {
            offset: record.ret_offset,
            len: record.ret_len,
        })
    }

    /// Performs a call whose reply is a scalar.
    pub fn ocall_u64(&mut self, call_id: u64, args: &[u8]) -> Result<u64, EdgeError> {
        let ret = self.ocall(call_id, args)?;
        let bytes = self.reply(ret, 8)?;
        Ok(LittleEndian::read_u64(bytes))
    }

    /// Performs a call whose reply is a [`WrappedReturnDescriptor`].
    pub fn ocall_descriptor(&mut self, call_id: u64, args: &[u8]) -> Result<WrappedReturnDescriptor, EdgeError> {
        let ret = self.ocall(call_id, args)?;
        let bytes = self.reply(ret, WrappedReturnDescriptor::SIZE)?;
        WrappedReturnDescriptor::read_from(bytes).map_err(|e| match e {
            layout::LayoutError::BufferTooSmall { needed, actual } => EdgeError::ShortReturn { expected: needed, actual },
        })
    }

    /// Borrows the payload a descriptor points at.
    pub fn wrapped_payload(&self, desc: &WrappedReturnDescriptor) -> Result<&[u8], EdgeError> {
        let range = checked_range(desc.offset, desc.size, self.shared.len()).ok_or(EdgeError::ReturnOutOfBounds {
            offset: desc.offset,
            len: desc.size,
        })?;
        Ok(&self.shared[range])
    }

    /// Copies exactly `out.len()` payload bytes out of the region.
    pub fn copy_from_shared(&self, desc: &WrappedReturnDescriptor, out: &mut [u8]) -> Result<(), EdgeError> {
        let payload = self.wrapped_payload(desc)?;
        if payload.len() != out.len() {
            return Err(EdgeError::ShortReturn { expected: out.len(), actual: payload.len() });
        }
        out.copy_from_slice(payload);
        Ok(())
    }

    /// Performs a call with a wrapped reply and copies the payload out.
    pub fn ocall_wrapped(&mut self, call_id: u64, args: &[u8]) -> Result<Vec<u8>, EdgeError> {
        let desc = self.ocall_descriptor(call_id, args)?;
        Ok(self.wrapped_payload(&desc)?.to_vec())
    }

    fn reply(&self, ret: Range<usize>, expected: usize) -> Result<&[u8], EdgeError> {
        if ret.len() < expected {
            return Err(EdgeError::ShortReturn { expected, actual: ret.len() });
        }
        Ok(&self.shared[ret.start..ret.start + expected])
    }
}
