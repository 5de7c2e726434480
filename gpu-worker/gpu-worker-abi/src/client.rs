/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::vec::Vec;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{MatmulJob, MatmulReport, Request, Response};

/// Upper bound on a single framed message. Bootstrap requests carry whole
/// images, so this is generous.
pub const MAX_MESSAGE_SIZE: u64 = 256 * 1024 * 1024;

/// Writes `msg` as a little-endian `u64` length followed by its CBOR encoding.
pub fn write_message<W: Write, T: Serialize>(stream: &mut W, msg: &T) -> Result<(), IoError> {
    let bin = serde_cbor::ser::to_vec(msg)
        .map_err(|e| IoError::new(IoErrorKind::InvalidData, e))?;
    stream.write_u64::<LittleEndian>(bin.len() as u64)?;
    stream.write_all(&bin)?;
    stream.flush()
}

/// Reads one message framed by [`write_message`].
pub fn read_message<R: Read, T: DeserializeOwned>(stream: &mut R) -> Result<T, IoError> {
    let size = stream.read_u64::<LittleEndian>()?;
    if size > MAX_MESSAGE_SIZE {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            std::format!("message of {} bytes exceeds limit", size),
        ));
    }
    let mut bin = Vec::new();
    bin.resize(size as usize, 0);
    stream.read_exact(&mut bin)?;
    serde_cbor::from_slice(&bin).map_err(|e| IoError::new(IoErrorKind::InvalidInput, e))
}

/// Blocking client for the gpu-worker host.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, IoError> {
        Ok(Client { stream: TcpStream::connect(addr)? })
    }

    pub fn send(&mut self, req: &Request) -> Result<Response, IoError> {
        write_message(&mut self.stream, req)?;
        read_message(&mut self.stream)
    }

    pub fn bootstrap(&mut self, enclave: Vec<u8>, runtime: Vec<u8>, loader: Vec<u8>) -> Result<bool, IoError> {
        match self.send(&Request::Bootstrap { enclave, runtime, loader })? {
            Response::Bootstrapped(ok) => Ok(ok),
            other => Err(unexpected(other)),
        }
    }

    pub fn helloworld(&mut self) -> Result<bool, IoError> {
        match self.send(&Request::HelloWorld)? {
            Response::HelloWorld(ok) => Ok(ok),
            other => Err(unexpected(other)),
        }
    }

    pub fn matmul(&mut self, job: Option<MatmulJob>) -> Result<(bool, Option<MatmulReport>), IoError> {
        match self.send(&Request::Matmul { job })? {
            Response::Matmul { completed, report } => Ok((completed, report)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: Response) -> IoError {
    IoError::new(IoErrorKind::InvalidData, std::format!("unexpected response: {:?}", resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn framing() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Response::HelloWorld(true)).unwrap();
        let body = serde_cbor::ser::to_vec(&Response::HelloWorld(true)).unwrap();
        assert_eq!(&buf[..8], &(body.len() as u64).to_le_bytes());
        assert_eq!(&buf[8..], &body[..]);

        let resp: Response = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(resp, Response::HelloWorld(true));
    }

    #[test]
    fn truncated_and_oversized_frames() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::HelloWorld).unwrap();
        buf.pop();
        let err = read_message::<_, Request>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::UnexpectedEof);

        let buf = (MAX_MESSAGE_SIZE + 1).to_le_bytes().to_vec();
        let err = read_message::<_, Request>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::InvalidData);
    }
}
