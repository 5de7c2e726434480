/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Diagnostics from inside the enclave, forwarded to the host log with
//! [`cmd::LOG_MSG`](gpu_worker_abi::cmd::LOG_MSG).
//!
//! A message is only delivered while a workload session is installed on the
//! host, so nothing may be logged after a workload's completion call.

use std::fmt;

use gpu_worker_abi::cmd;

use crate::edge::{EdgeCaller, EdgeError, EdgeTransport};

/// Maximum size of a log message including its terminating NUL.
pub const LOG_MSG_CAPACITY: usize = 2048;

/// Fixed-capacity message buffer. Output beyond the capacity is dropped.
pub struct LogMessage {
    buf: [u8; LOG_MSG_CAPACITY],
    len: usize,
}

impl LogMessage {
    pub fn new() -> Self {
        LogMessage { buf: [0; LOG_MSG_CAPACITY], len: 0 }
    }

    pub fn format(args: fmt::Arguments<'_>) -> Self {
        let mut msg = LogMessage::new();
        // Writing never fails, it truncates.
        let _ = fmt::write(&mut msg, args);
        msg
    }

    /// The message text followed by a single NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..=self.len]
    }
}

impl Default for LogMessage {
    fn default() -> Self {
        LogMessage::new()
    }
}

impl fmt::Write for LogMessage {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LOG_MSG_CAPACITY - 1 - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

pub fn send<T: EdgeTransport>(caller: &mut EdgeCaller<'_, T>, args: fmt::Arguments<'_>) -> Result<u64, EdgeError> {
    let msg = LogMessage::format(args);
    caller.ocall_u64(cmd::LOG_MSG, msg.as_bytes_with_nul())
}

/// Formats a message and forwards it to the host log.
///
/// ```ignore
/// enclave_log!(caller, "received {} chunks", n)?;
/// ```
#[macro_export]
macro_rules! enclave_log {
    ($caller:expr, $($arg:tt)+) => {
        $crate::logging::send($caller, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_worker_abi::layout::DATA_OFFSET;
    use gpu_worker_abi::CallRecord;

    #[test]
    fn truncates_and_terminates() {
        let long = "x".repeat(3000);
        let msg = LogMessage::format(format_args!("{}{}", "ab", long));
        let bytes = msg.as_bytes_with_nul();
        assert_eq!(bytes.len(), LOG_MSG_CAPACITY);
        assert_eq!(&bytes[..2], b"ab");
        assert_eq!(bytes[LOG_MSG_CAPACITY - 1], 0);

        let short = LogMessage::format(format_args!("rows={}", 4));
        assert_eq!(short.as_bytes_with_nul(), b"rows=4\0");
    }

    #[test]
    fn sends_log_msg() {
        let mut region = vec![0u8; 4096];
        let mut received = Vec::new();
        {
            let mut caller = EdgeCaller::new(&mut region, |shared: &mut [u8]| {
                let mut record = CallRecord::read_from(shared).unwrap();
                received.push((record.call_id, shared[DATA_OFFSET..][..record.arg_len as usize].to_vec()));
                shared[DATA_OFFSET..DATA_OFFSET + 8].copy_from_slice(&0u64.to_le_bytes());
                record.ret_offset = DATA_OFFSET as u64;
                record.ret_len = 8;
                record.write_to(shared).unwrap();
            })
            .unwrap();
            assert_eq!(enclave_log!(&mut caller, "chunk {} of {}", 1, 2), Ok(0));
        }
        assert_eq!(received, vec![(cmd::LOG_MSG, b"chunk 1 of 2\0".to_vec())]);
    }
}
