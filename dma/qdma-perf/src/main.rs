// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Queue DMA throughput benchmark
//!
//! Every worker thread drives its own device, channel and portal against a
//! loopback hardware queue that performs the copies in memory:
//!
//! ```text
//!   worker N ── copy / copy_sg ──▶ vchan 0 ──▶ LoopbackQueue ──┐
//!      ▲                                                       │
//!      └──────────────────── completed ◀───────────────────────┘
//! ```
//!
//! Configuration comes from `QDMA_PERF_*` environment variables.

use std::time::Duration;

use log::info;

mod benchmark;

use crate::benchmark::BenchConfig;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("qdma-perf v{}", env!("CARGO_PKG_VERSION"));

    let config = parse_config();
    info!("Configuration: {:?}", config);

    let results = benchmark::run(&config)?;
    results.print();

    if config.verify && !results.verified() {
        anyhow::bail!("destination buffers do not match their sources");
    }
    Ok(())
}

fn parse_flag(val: &str) -> bool {
    val == "1" || val.to_lowercase() == "true"
}

/// Parse configuration from environment
fn parse_config() -> BenchConfig {
    let mut config = BenchConfig::default();

    if let Ok(val) = std::env::var("QDMA_PERF_WORKERS") {
        if let Ok(n) = val.parse() {
            config.workers = n;
        }
    }

    if let Ok(val) = std::env::var("QDMA_PERF_SECS") {
        if let Ok(n) = val.parse() {
            config.duration = Duration::from_secs(n);
        }
    }

    if let Ok(val) = std::env::var("QDMA_PERF_BUF_SIZE") {
        if let Ok(n) = val.parse() {
            config.buf_size = n;
        }
    }

    if let Ok(val) = std::env::var("QDMA_PERF_NR_BUF") {
        if let Ok(n) = val.parse() {
            config.nr_buf = n;
        }
    }

    if let Ok(val) = std::env::var("QDMA_PERF_KICK_BATCH") {
        if let Ok(n) = val.parse() {
            config.kick_batch = n;
        }
    }

    if let Ok(val) = std::env::var("QDMA_PERF_RING_SIZE") {
        if let Ok(n) = val.parse() {
            config.ring_size = n;
        }
    }

    if let Ok(val) = std::env::var("QDMA_PERF_SG_ENTRIES") {
        if let Ok(n) = val.parse() {
            config.sg_entries = n;
        }
    }

    if let Ok(val) = std::env::var("QDMA_PERF_SHORT_FD") {
        config.short_fd = parse_flag(&val);
    }

    if let Ok(val) = std::env::var("QDMA_PERF_PRE_POPULATE") {
        config.pre_populate = parse_flag(&val);
    }

    if let Ok(val) = std::env::var("QDMA_PERF_VERIFY") {
        config.verify = parse_flag(&val);
    }

    config
}
