/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use gpu_worker_abi::{MatmulJob, SERVER_PORT};
use gpu_worker_host::{EnclaveParams, EnclaveRegistry, Server, Simulator};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address the request server listens on
    #[arg(short, long, default_value_t = format!("127.0.0.1:{}", SERVER_PORT))]
    listen: String,

    /// Size of the memory region shared with the enclave (in bytes)
    #[arg(long, default_value_t = EnclaveParams::DEFAULT_UNTRUSTED_MEM_SIZE)]
    untrusted_mem_size: usize,

    /// Heap available to the enclave application (in bytes)
    #[arg(long, default_value_t = EnclaveParams::DEFAULT_FREE_MEM_SIZE)]
    free_mem_size: usize,

    /// Elements per chunk when streaming the default matrix multiply job
    #[arg(long)]
    chunk_len: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    let params = EnclaveParams::builder()
        .untrusted_mem_size(cli.untrusted_mem_size)
        .free_mem_size(cli.free_mem_size)
        .build()
        .context("invalid enclave parameters")?;

    let mut default_job = MatmulJob::demo();
    if let Some(chunk_len) = cli.chunk_len {
        anyhow::ensure!(chunk_len > 0, "`--chunk-len` must be positive");
        default_job.chunk_len = chunk_len;
    }

    let registry = EnclaveRegistry::new(Box::new(Simulator), params).with_default_job(default_job);
    let server = Server::bind(&cli.listen, Arc::new(registry))
        .with_context(|| format!("failed to listen on {}", cli.listen))?;
    server.run().context("request server failed")?;
    Ok(())
}
