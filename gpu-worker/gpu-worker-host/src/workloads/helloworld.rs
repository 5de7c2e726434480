/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use gpu_worker_abi::{cmd, ret};
use log::{info, warn};

use super::{Step, Workload};
use crate::shared_buffer::SharedBuffer;

/// Prints one string sent by the enclave and replies with its length.
#[derive(Debug, Default)]
pub struct HelloWorld {
    message: Option<String>,
}

impl HelloWorld {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Workload for HelloWorld {
    const NAME: &'static str = "helloworld";
    /// The message, if it was well formed.
    type Output = Option<String>;

    fn start_selector(&self) -> u64 {
        ret::START_HELLOWORLD
    }

    fn on_call(&mut self, call_id: u64, buf: &mut SharedBuffer<'_>) -> Step {
        if call_id != cmd::HELLOWORLD_PRINT_STRING {
            return Step::Spurious;
        }
        match buf.read_c_str() {
            Some(s) => {
                let len = s.to_bytes().len() as u64;
                let text = s.to_string_lossy().into_owned();
                info!("Enclave said: {}", text);
                let _ = buf.write_scalar_return(len);
                self.message = Some(text);
            }
            None => warn!("helloworld: malformed string argument"),
        }
        Step::Finished
    }

    fn finish(self) -> Option<String> {
        self.message
    }
}
