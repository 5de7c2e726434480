/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Byte layout of the shared region.
//!
//! ```text
//! 0                48                 64
//! +----------------+------------------+-----------------------------+
//! |  CallRecord    |  scratch data area (arguments / return values) |
//! +----------------+------------------+-----------------------------+
//!                  | WrappedReturn-   | wrapped payload ...         |
//!                  | Descriptor       |                             |
//! ```
//!
//! All fields are little-endian `u64`s. Both sides must agree on this layout
//! bit for bit; it is only ever accessed through the functions in this
//! module.

use core::convert::TryFrom;
use core::fmt;
use core::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

/// Offset of the scratch data area, immediately after the [`CallRecord`].
pub const DATA_OFFSET: usize = CallRecord::SIZE;

/// Offset of the payload of a wrapped return, immediately after its
/// descriptor.
pub const WRAPPED_PAYLOAD_OFFSET: usize = DATA_OFFSET + WrappedReturnDescriptor::SIZE;

/// Validates that `len` bytes starting at `offset` lie within a region of
/// `region_len` bytes.
///
/// This is the only rule by which an integer received across the trust
/// boundary may become a range of the region.
pub fn checked_range(offset: u64, len: u64, region_len: usize) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let len = usize::try_from(len).ok()?;
    let end = start.checked_add(len)?;
    if end > region_len {
        return None;
    }
    Some(start..end)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    BufferTooSmall { needed: usize, actual: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::BufferTooSmall { needed, actual } => {
                write!(f, "buffer of {} bytes cannot hold {} bytes", actual, needed)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LayoutError {}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), LayoutError> {
    if buf.len() < needed {
        Err(LayoutError::BufferTooSmall { needed, actual: buf.len() })
    } else {
        Ok(())
    }
}

/// Outcome of an edge call as seen by the enclave. The numbering follows the
/// Keystone edge-call headers.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    Ok = 0,
    /// An offset/length pair supplied by the enclave did not lie within the
    /// shared region.
    BadOffset = 2,
    /// The host could not place its return value in the shared region.
    BadPtr = 3,
}

impl CallStatus {
    pub fn from_raw(raw: u64) -> Option<CallStatus> {
        match raw {
            0 => Some(CallStatus::Ok),
            2 => Some(CallStatus::BadOffset),
            3 => Some(CallStatus::BadPtr),
            _ => None,
        }
    }
}

/// The call header at offset 0 of the shared region.
///
/// The enclave writes `call_id` and the argument fields, then blocks. The host
/// writes `status` and the return fields, then control returns to the
/// enclave. The two sides never write it concurrently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallRecord {
    pub call_id: u64,
    pub arg_offset: u64,
    pub arg_len: u64,
    /// Raw [`CallStatus`]; kept raw so an unknown value can be reported
    /// instead of misread.
    pub status: u64,
    pub ret_offset: u64,
    pub ret_len: u64,
}

impl CallRecord {
    pub const SIZE: usize = 6 * 8;

    pub fn read_from(buf: &[u8]) -> Result<CallRecord, LayoutError> {
        ensure_len(buf, Self::SIZE)?;
        Ok(CallRecord {
            call_id: LittleEndian::read_u64(&buf[0..8]),
            arg_offset: LittleEndian::read_u64(&buf[8..16]),
            arg_len: LittleEndian::read_u64(&buf[16..24]),
            status: LittleEndian::read_u64(&buf[24..32]),
            ret_offset: LittleEndian::read_u64(&buf[32..40]),
            ret_len: LittleEndian::read_u64(&buf[40..48]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), LayoutError> {
        ensure_len(buf, Self::SIZE)?;
        LittleEndian::write_u64(&mut buf[0..8], self.call_id);
        LittleEndian::write_u64(&mut buf[8..16], self.arg_offset);
        LittleEndian::write_u64(&mut buf[16..24], self.arg_len);
        LittleEndian::write_u64(&mut buf[24..32], self.status);
        LittleEndian::write_u64(&mut buf[32..40], self.ret_offset);
        LittleEndian::write_u64(&mut buf[40..48], self.ret_len);
        Ok(())
    }

    pub fn call_status(&self) -> Option<CallStatus> {
        CallStatus::from_raw(self.status)
    }
}

/// `{size, offset}` pair describing a variable-length return payload.
///
/// Used when the scalar return slot cannot describe the result, i.e. whenever
/// the result size is not statically known to both sides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WrappedReturnDescriptor {
    pub size: u64,
    pub offset: u64,
}

impl WrappedReturnDescriptor {
    pub const SIZE: usize = 2 * 8;

    pub fn read_from(buf: &[u8]) -> Result<WrappedReturnDescriptor, LayoutError> {
        ensure_len(buf, Self::SIZE)?;
        Ok(WrappedReturnDescriptor {
            size: LittleEndian::read_u64(&buf[0..8]),
            offset: LittleEndian::read_u64(&buf[8..16]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), LayoutError> {
        ensure_len(buf, Self::SIZE)?;
        LittleEndian::write_u64(&mut buf[0..8], self.size);
        LittleEndian::write_u64(&mut buf[8..16], self.offset);
        Ok(())
    }
}
