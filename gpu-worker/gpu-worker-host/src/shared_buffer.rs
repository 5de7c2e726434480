/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Host view of the shared region for the duration of one edge call.
//!
//! Every integer in the [`CallRecord`] was written by the enclave and is
//! untrusted. The only way to turn an offset into bytes is
//! [`SharedBuffer::resolve`], which applies [`checked_range`] and yields a
//! [`Span`]. Failures are reported to the enclave through the status field of
//! the record; nothing here panics on enclave input.

use std::ffi::CStr;
use std::ops::Range;

use gpu_worker_abi::layout::{checked_range, DATA_OFFSET, WRAPPED_PAYLOAD_OFFSET};
use gpu_worker_abi::{CallRecord, CallStatus, WrappedReturnDescriptor};
use log::warn;
use thiserror::Error;

use crate::HostError;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("range {offset:#x}+{len} is outside the {region_len} byte shared region")]
pub struct BoundaryViolation {
    pub offset: u64,
    pub len: u64,
    pub region_len: usize,
}

/// A validated range of the shared region. Only [`SharedBuffer::resolve`]
/// creates these.
#[derive(Debug, PartialEq, Eq)]
pub struct Span {
    range: Range<usize>,
}

impl Span {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

pub struct SharedBuffer<'a> {
    region: &'a mut [u8],
    record: CallRecord,
}

impl<'a> SharedBuffer<'a> {
    pub fn new(region: &'a mut [u8]) -> Result<Self, HostError> {
        let record = CallRecord::read_from(region).map_err(|_| HostError::RegionTooSmall(region.len()))?;
        Ok(SharedBuffer { region, record })
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn record(&self) -> CallRecord {
        self.record
    }

    pub fn call_id(&self) -> u64 {
        self.record.call_id
    }

    pub fn status(&self) -> u64 {
        self.record.status
    }

    pub fn set_ok(&mut self) {
        self.set_status(CallStatus::Ok)
    }

    fn set_status(&mut self, status: CallStatus) {
        self.record.status = status as u64;
        self.commit();
    }

    fn commit(&mut self) {
        self.record
            .write_to(self.region)
            .expect("region length checked on construction");
    }

    /// Validates `len` bytes at `offset`. Sets `BAD_OFFSET` on failure.
    pub fn resolve(&mut self, offset: u64, len: u64) -> Result<Span, BoundaryViolation> {
        match checked_range(offset, len, self.region.len()) {
            Some(range) => Ok(Span { range }),
            None => {
                let violation = BoundaryViolation { offset, len, region_len: self.region.len() };
                warn!("call {}: {}", self.record.call_id, violation);
                self.set_status(CallStatus::BadOffset);
                Err(violation)
            }
        }
    }

    pub fn bytes(&self, span: &Span) -> &[u8] {
        &self.region[span.range.clone()]
    }

    pub fn read_args(&mut self) -> Option<Span> {
        let CallRecord { arg_offset, arg_len, .. } = self.record;
        self.resolve(arg_offset, arg_len).ok()
    }

    pub fn read_arg_bytes(&mut self) -> Option<&[u8]> {
        let span = self.read_args()?;
        Some(self.bytes(&span))
    }

    /// The argument up to its first NUL. An argument without a NUL inside
    /// `arg_len` is a boundary violation.
    pub fn read_c_str(&mut self) -> Option<&CStr> {
        let span = self.read_args()?;
        if CStr::from_bytes_until_nul(self.bytes(&span)).is_err() {
            warn!("call {}: argument is not NUL-terminated", self.record.call_id);
            self.set_status(CallStatus::BadOffset);
            return None;
        }
        CStr::from_bytes_until_nul(self.bytes(&span)).ok()
    }

    pub fn read_c_string(&mut self) -> Option<String> {
        self.read_c_str().map(|s| s.to_string_lossy().into_owned())
    }

    /// The first eight argument bytes as a little-endian `u64`.
    pub fn read_u64(&mut self) -> Option<u64> {
        let CallRecord { arg_offset, arg_len, .. } = self.record;
        if arg_len < 8 {
            warn!("call {}: {} byte argument cannot hold a u64", self.record.call_id, arg_len);
            self.set_status(CallStatus::BadOffset);
            return None;
        }
        let span = self.resolve(arg_offset, 8).ok()?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(&span));
        Some(u64::from_le_bytes(raw))
    }

    fn reserve_return(&mut self, offset: usize, len: usize) -> Result<Range<usize>, BoundaryViolation> {
        checked_range(offset as u64, len as u64, self.region.len()).ok_or_else(|| {
            let violation = BoundaryViolation { offset: offset as u64, len: len as u64, region_len: self.region.len() };
            warn!("call {}: return value does not fit: {}", self.record.call_id, violation);
            self.set_status(CallStatus::BadPtr);
            violation
        })
    }

    /// Places `value` at the start of the data area. Sets `BAD_PTR` and
    /// writes nothing if it does not fit.
    pub fn write_scalar_return(&mut self, value: u64) -> Result<(), BoundaryViolation> {
        let range = self.reserve_return(DATA_OFFSET, 8)?;
        self.region[range].copy_from_slice(&value.to_le_bytes());
        self.record.ret_offset = DATA_OFFSET as u64;
        self.record.ret_len = 8;
        self.set_ok();
        Ok(())
    }

    /// Places a [`WrappedReturnDescriptor`] at the start of the data area and
    /// `data` right after it. Sets `BAD_PTR` and writes nothing if either
    /// does not fit.
    pub fn write_wrapped_return(&mut self, data: &[u8]) -> Result<(), BoundaryViolation> {
        let desc_range = self.reserve_return(DATA_OFFSET, WrappedReturnDescriptor::SIZE)?;
        let payload_range = self.reserve_return(WRAPPED_PAYLOAD_OFFSET, data.len())?;

        let desc = WrappedReturnDescriptor { size: data.len() as u64, offset: WRAPPED_PAYLOAD_OFFSET as u64 };
        self.region[payload_range].copy_from_slice(data);
        desc.write_to(&mut self.region[desc_range])
            .expect("descriptor range has descriptor size");
        self.record.ret_offset = DATA_OFFSET as u64;
        self.record.ret_len = WrappedReturnDescriptor::SIZE as u64;
        self.set_ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_with(record: CallRecord, len: usize) -> Vec<u8> {
        let mut region = vec![0u8; len];
        record.write_to(&mut region).unwrap();
        region
    }

    fn args_at(offset: u64, len: u64) -> CallRecord {
        CallRecord { call_id: 100, arg_offset: offset, arg_len: len, ..Default::default() }
    }

    #[test]
    fn resolve_bounds() {
        let mut region = region_with(CallRecord::default(), 256);
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        assert_eq!(buf.resolve(0, 256).unwrap().len(), 256);
        assert!(buf.resolve(256, 0).unwrap().is_empty());
        assert_eq!(buf.status(), CallStatus::Ok as u64);

        assert_eq!(
            buf.resolve(200, 57),
            Err(BoundaryViolation { offset: 200, len: 57, region_len: 256 })
        );
        assert_eq!(buf.status(), CallStatus::BadOffset as u64);
        assert!(buf.resolve(u64::MAX, 2).is_err());
        assert!(buf.resolve(2, u64::MAX).is_err());
        drop(buf);
        assert_eq!(CallRecord::read_from(&region).unwrap().status, CallStatus::BadOffset as u64);
    }

    #[test]
    fn region_must_hold_record() {
        let mut region = vec![0u8; 47];
        assert!(matches!(SharedBuffer::new(&mut region), Err(HostError::RegionTooSmall(47))));
    }

    #[test]
    fn c_string_arguments() {
        let mut region = region_with(args_at(48, 12), 128);
        region[48..60].copy_from_slice(b"Hello World\0");
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        assert_eq!(buf.read_c_str().unwrap().to_bytes().len(), 11);
        assert_eq!(buf.read_c_string().as_deref(), Some("Hello World"));

        // NUL beyond arg_len
        let mut region = region_with(args_at(48, 4), 128);
        region[48..53].copy_from_slice(b"abcd\0");
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        assert_eq!(buf.read_c_string(), None);
        assert_eq!(buf.status(), CallStatus::BadOffset as u64);

        let mut region = region_with(args_at(120, 16), 128);
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        assert_eq!(buf.read_c_string(), None);
        assert_eq!(buf.status(), CallStatus::BadOffset as u64);
    }

    #[test]
    fn u64_arguments() {
        let mut region = region_with(args_at(48, 8), 64);
        region[48..56].copy_from_slice(&0x1122u64.to_le_bytes());
        assert_eq!(SharedBuffer::new(&mut region).unwrap().read_u64(), Some(0x1122));

        let mut region = region_with(args_at(48, 4), 64);
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        assert_eq!(buf.read_u64(), None);
        assert_eq!(buf.status(), CallStatus::BadOffset as u64);
    }

    #[test]
    fn scalar_return() {
        let mut region = region_with(args_at(48, 0), 64);
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        buf.write_scalar_return(11).unwrap();
        let record = CallRecord::read_from(&region).unwrap();
        assert_eq!((record.status, record.ret_offset, record.ret_len), (0, 48, 8));
        assert_eq!(&region[48..56], &11u64.to_le_bytes());

        let mut region = region_with(args_at(48, 0), 50);
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        assert!(buf.write_scalar_return(11).is_err());
        assert_eq!(buf.status(), CallStatus::BadPtr as u64);
        assert_eq!(buf.record().ret_len, 0);
        assert_eq!(&region[48..50], &[0, 0]);
    }

    #[test]
    fn wrapped_return_fills_region() {
        const L: usize = 160;
        for size in 0..=L - WRAPPED_PAYLOAD_OFFSET {
            let data: Vec<u8> = (0..size).map(|i| i as u8 ^ 0x5a).collect();
            let mut region = region_with(CallRecord::default(), L);
            SharedBuffer::new(&mut region).unwrap().write_wrapped_return(&data).unwrap();

            let record = CallRecord::read_from(&region).unwrap();
            assert_eq!(record.status, 0);
            let ret = checked_range(record.ret_offset, record.ret_len, L).unwrap();
            let desc = WrappedReturnDescriptor::read_from(&region[ret]).unwrap();
            assert_eq!(desc.size, size as u64);
            let payload = checked_range(desc.offset, desc.size, L).unwrap();
            assert_eq!(&region[payload], &data[..]);
        }
    }

    #[test]
    fn oversized_wrapped_return_commits_nothing() {
        const L: usize = 100;
        let mut region = region_with(CallRecord::default(), L);
        let before = region.clone();
        let mut buf = SharedBuffer::new(&mut region).unwrap();
        let data = vec![0xffu8; L - WRAPPED_PAYLOAD_OFFSET + 1];
        assert!(buf.write_wrapped_return(&data).is_err());
        assert_eq!(buf.status(), CallStatus::BadPtr as u64);
        drop(buf);
        assert_eq!(&region[CallRecord::SIZE..], &before[CallRecord::SIZE..]);
        let record = CallRecord::read_from(&region).unwrap();
        assert_eq!((record.ret_offset, record.ret_len), (0, 0));
    }
}
