/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context};
use clap::{Parser, Subcommand};
use env_logger::Env;
use gpu_worker_abi::{Client, MatmulJob, MatmulStatus, SERVER_PORT};
use log::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address of the gpu-worker host
    #[arg(short, long, default_value_t = format!("127.0.0.1:{}", SERVER_PORT))]
    server: String,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the enclave instance from its images
    Bootstrap {
        /// Path to the enclave application ELF
        enclave: PathBuf,
        /// Path to the enclave runtime ELF
        runtime: PathBuf,
        /// Path to the loader image
        loader: PathBuf,
    },
    /// Run the helloworld workload
    Helloworld,
    /// Run the matrix multiply workload
    Matmul {
        #[arg(long)]
        rows: Option<u64>,
        #[arg(long)]
        cols: Option<u64>,
        /// Comma separated elements of the left matrix, row-major
        #[arg(long, value_delimiter = ',')]
        lhs: Option<Vec<f32>>,
        /// Comma separated elements of the right matrix, row-major
        #[arg(long, value_delimiter = ',')]
        rhs: Option<Vec<f32>>,
        /// Elements per chunk (default 4). Only valid with an explicit job.
        #[arg(long)]
        chunk_len: Option<u64>,
    },
}

const DEFAULT_CHUNK_LEN: u64 = 4;

/// Builds the job from the `matmul` arguments. `None` asks the host for its
/// configured default job.
fn matmul_job(
    rows: Option<u64>,
    cols: Option<u64>,
    lhs: Option<Vec<f32>>,
    rhs: Option<Vec<f32>>,
    chunk_len: Option<u64>,
) -> Result<Option<MatmulJob>, anyhow::Error> {
    match (rows, cols, lhs, rhs) {
        (Some(rows), Some(cols), Some(lhs), Some(rhs)) => {
            let chunk_len = chunk_len.unwrap_or(DEFAULT_CHUNK_LEN);
            ensure!(chunk_len > 0, "`--chunk-len` must be positive");
            Ok(Some(MatmulJob { rows, cols, lhs, rhs, chunk_len }))
        }
        (None, None, None, None) => {
            ensure!(chunk_len.is_none(), "`--chunk-len` requires `--rows`, `--cols`, `--lhs` and `--rhs`");
            Ok(None)
        }
        _ => bail!("`--rows`, `--cols`, `--lhs` and `--rhs` must be given together"),
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>, anyhow::Error> {
    let image = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    debug!("read {} bytes from {}", image.len(), path.display());
    Ok(image)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    let mut client = Client::connect(&cli.server).with_context(|| format!("failed to connect to {}", cli.server))?;

    match cli.command {
        Command::Bootstrap { enclave, runtime, loader } => {
            let ok = client.bootstrap(read_image(&enclave)?, read_image(&runtime)?, read_image(&loader)?)?;
            ensure!(ok, "bootstrap refused (an instance may already be running)");
            info!("enclave bootstrapped");
        }
        Command::Helloworld => {
            ensure!(client.helloworld()?, "helloworld failed");
            info!("helloworld completed");
        }
        Command::Matmul { rows, cols, lhs, rhs, chunk_len } => {
            let job = matmul_job(rows, cols, lhs, rhs, chunk_len)?;
            let (completed, report) = client.matmul(job)?;
            ensure!(completed, "matmul failed");
            match report {
                Some(report) if report.status == MatmulStatus::Completed => {
                    info!("{}x{} result: {:?}", report.rows, report.cols, report.data);
                    info!("checksums: input {}, output {}", report.input_checksum, report.output_checksum);
                }
                Some(report) => info!("enclave refused {}x{} operands: dimension mismatch", report.rows, report.cols),
                None => info!("matmul completed without a report"),
            }
        }
    }
    Ok(())
}
