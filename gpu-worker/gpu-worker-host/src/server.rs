/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use gpu_worker_abi::{read_message, write_message, Request, Response};
use log::{debug, info, warn};

use crate::platform::EnclaveImages;
use crate::registry::EnclaveRegistry;
use crate::HostError;

/// Serves [`Request`]s over TCP, one thread per connection. A connection may
/// carry any number of requests.
pub struct Server {
    listener: TcpListener,
    registry: Arc<EnclaveRegistry>,
}

impl Server {
    pub fn bind<A: ToSocketAddrs>(addr: A, registry: Arc<EnclaveRegistry>) -> Result<Self, HostError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Server { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IoError> {
        self.listener.local_addr()
    }

    fn log_communication(stream: &TcpStream, msg: &str, arrow: &str) {
        let peer = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_default();
        debug!("{:>21} {} host: {}", peer, arrow, msg);
    }

    fn describe(req: &Request) -> String {
        match req {
            Request::Bootstrap { enclave, runtime, loader } => format!(
                "Bootstrap {{ enclave: {} bytes, runtime: {} bytes, loader: {} bytes }}",
                enclave.len(),
                runtime.len(),
                loader.len()
            ),
            other => format!("{:?}", other),
        }
    }

    /// Executes one request. Failures are logged and surface as a negative
    /// response.
    pub fn handle_request(registry: &EnclaveRegistry, req: Request) -> Response {
        match req {
            Request::Bootstrap { enclave, runtime, loader } => {
                let images = EnclaveImages { enclave, runtime, loader };
                match registry.bootstrap(&images) {
                    Ok(()) => Response::Bootstrapped(true),
                    Err(e) => {
                        warn!("bootstrap failed: {}", e);
                        Response::Bootstrapped(false)
                    }
                }
            }
            Request::HelloWorld => match registry.run_helloworld() {
                Ok(_) => Response::HelloWorld(true),
                Err(e) => {
                    warn!("helloworld failed: {}", e);
                    Response::HelloWorld(false)
                }
            },
            Request::Matmul { job } => match registry.run_matmul(job) {
                Ok(report) => Response::Matmul { completed: true, report },
                Err(e) => {
                    warn!("matmul failed: {}", e);
                    Response::Matmul { completed: false, report: None }
                }
            },
        }
    }

    fn handle_client(registry: &EnclaveRegistry, stream: &mut TcpStream) -> Result<(), IoError> {
        loop {
            let req: Request = match read_message(stream) {
                Ok(req) => req,
                Err(e) if e.kind() == IoErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            Self::log_communication(stream, &Self::describe(&req), "->");
            let resp = Self::handle_request(registry, req);
            Self::log_communication(stream, &format!("{:?}", resp), "<-");
            write_message(stream, &resp)?;
        }
    }

    pub fn run(&self) -> Result<(), HostError> {
        info!("listening on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            let mut stream = stream?;
            let registry = self.registry.clone();
            thread::Builder::new().name("rpc".to_string()).spawn(move || {
                if let Err(e) = Self::handle_client(&registry, &mut stream) {
                    warn!("error handling connection: {}, shutting connection down", e);
                    let _ = stream.shutdown(Shutdown::Both);
                }
            })?;
        }
        Ok(())
    }
}
