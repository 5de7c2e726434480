/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Running population count over a byte stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checksum(u64);

impl Checksum {
    pub fn new() -> Self {
        Checksum(0)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0 += bytes.iter().map(|b| u64::from(b.count_ones())).sum::<u64>();
    }

    pub fn update_f32(&mut self, values: &[f32]) {
        for v in values {
            self.update(&v.to_le_bytes());
        }
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}
