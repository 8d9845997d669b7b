// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Benchmark workers and result reporting

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;

use qdma::config::MAX_SG;
use qdma::{
    DevConf, Device, Error, Generation, HwQueue, LoopbackQueue, OpFlags, Portal, SgBuf, VchanConf,
    VchanOptions,
};

/// Polls spent waiting for the last completions of a run
const DRAIN_POLLS: usize = 1_000_000;

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Worker threads (0 = one per CPU)
    pub workers: usize,
    /// Time spent enqueueing
    pub duration: Duration,
    /// Bytes moved by one job
    pub buf_size: usize,
    /// Source/destination buffer pairs cycled through per worker
    pub nr_buf: usize,
    /// Jobs queued between doorbells
    pub kick_batch: usize,
    /// Descriptors per channel
    pub ring_size: usize,
    /// Split each job into this many SG entries (0 = plain copy)
    pub sg_entries: usize,
    pub short_fd: bool,
    pub pre_populate: bool,
    /// Compare destinations against sources after the run
    pub verify: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            duration: Duration::from_secs(5),
            buf_size: 4096,
            nr_buf: 1024,
            kick_batch: 32,
            ring_size: 1024,
            sg_entries: 0,
            short_fd: false,
            pre_populate: false,
            verify: true,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buf_size == 0 || u32::try_from(self.buf_size).is_err() {
            bail!("buffer size {} out of range", self.buf_size);
        }
        if self.nr_buf == 0 {
            bail!("at least one buffer is needed");
        }
        if self.kick_batch == 0 {
            bail!("kick batch must be non-zero");
        }
        if self.sg_entries > MAX_SG {
            bail!("{} SG entries exceed the limit of {}", self.sg_entries, MAX_SG);
        }
        if self.sg_entries > 0 && self.buf_size % self.sg_entries != 0 {
            bail!(
                "buffer size {} does not split into {} SG entries",
                self.buf_size,
                self.sg_entries
            );
        }
        if self.ring_size < self.entries_per_job() {
            bail!("ring size {} cannot hold one job", self.ring_size);
        }
        Ok(())
    }

    fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Completions produced by one job
    fn entries_per_job(&self) -> usize {
        self.sg_entries.max(1)
    }
}

/// Outcome of one worker
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub worker: usize,
    /// Completed operations (SG entries count one each)
    pub ops: u64,
    pub bytes: u64,
    pub errors: u64,
    pub elapsed: Duration,
    /// `None` when verification was skipped
    pub verified: Option<bool>,
}

impl WorkerResult {
    pub fn mops(&self) -> f64 {
        rate(self.ops, self.elapsed) / 1e6
    }

    pub fn gbps(&self) -> f64 {
        rate(self.bytes * 8, self.elapsed) / 1e9
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Results of all workers
#[derive(Debug, Clone)]
pub struct BenchResults {
    pub workers: Vec<WorkerResult>,
}

impl BenchResults {
    pub fn total_ops(&self) -> u64 {
        self.workers.iter().map(|w| w.ops).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.workers.iter().map(|w| w.bytes).sum()
    }

    /// Workers run concurrently; the slowest one bounds the run
    pub fn elapsed(&self) -> Duration {
        self.workers
            .iter()
            .map(|w| w.elapsed)
            .max()
            .unwrap_or_default()
    }

    pub fn verified(&self) -> bool {
        self.workers.iter().all(|w| w.verified != Some(false))
    }

    pub fn print(&self) {
        println!(
            "{:>6} {:>14} {:>10} {:>10} {:>8} {:>8}",
            "worker", "ops", "MOps", "Gbps", "errors", "verify"
        );
        for w in &self.workers {
            println!(
                "{:>6} {:>14} {:>10.3} {:>10.3} {:>8} {:>8}",
                w.worker,
                w.ops,
                w.mops(),
                w.gbps(),
                w.errors,
                match w.verified {
                    Some(true) => "ok",
                    Some(false) => "FAILED",
                    None => "-",
                }
            );
        }

        let elapsed = self.elapsed();
        println!(
            "{:>6} {:>14} {:>10.3} {:>10.3} {:>8}",
            "total",
            self.total_ops(),
            rate(self.total_ops(), elapsed) / 1e6,
            rate(self.total_bytes() * 8, elapsed) / 1e9,
            self.workers.iter().map(|w| w.errors).sum::<u64>()
        );
    }
}

/// Run every worker to completion
pub fn run(config: &BenchConfig) -> Result<BenchResults> {
    config.validate()?;
    let workers = config.worker_count();
    info!(
        "qdma-perf: {} workers, {} x {} bytes, {}",
        workers,
        config.nr_buf,
        config.buf_size,
        if config.sg_entries > 0 {
            format!("SG copy with {} entries", config.sg_entries)
        } else {
            "plain copy".to_string()
        }
    );

    let results = Arc::new(Mutex::new(Vec::with_capacity(workers)));
    let mut handles = Vec::with_capacity(workers);

    for id in 0..workers {
        let config = config.clone();
        let results = Arc::clone(&results);

        let handle = thread::Builder::new()
            .name(format!("qdma-perf-{}", id))
            .spawn(move || -> Result<()> {
                let result = worker(id, &config)?;
                results.lock().push(result);
                Ok(())
            })
            .context("failed to spawn worker thread")?;

        handles.push((id, handle));
    }

    for (id, handle) in handles {
        handle
            .join()
            .map_err(|_| anyhow!("worker {} panicked", id))?
            .with_context(|| format!("worker {} failed", id))?;
    }

    let mut workers = std::mem::take(&mut *results.lock());
    workers.sort_by_key(|w| w.worker);
    Ok(BenchResults { workers })
}

/// Source and destination entries of one job
struct Job {
    src: Vec<SgBuf>,
    dst: Vec<SgBuf>,
}

impl Job {
    fn new(config: &BenchConfig, buf: usize, src_base: u64, dst_base: u64) -> Self {
        let entries = config.entries_per_job();
        let chunk = config.buf_size / entries;
        let offset = (buf * config.buf_size) as u64;

        let split = |base: u64| {
            (0..entries)
                .map(|i| SgBuf::new(base + offset + (i * chunk) as u64, chunk as u32))
                .collect::<Vec<_>>()
        };
        Self {
            src: split(src_base),
            dst: split(dst_base),
        }
    }
}

fn open_device(id: usize, config: &BenchConfig, hw: Arc<LoopbackQueue>) -> Result<Device> {
    let queues: Vec<Arc<dyn HwQueue>> = vec![hw];
    let mut dev = Device::open(id as u32, &format!("dpdmai.{}", id), Generation::Lx2160, queues)
        .context("failed to open device")?;

    dev.configure(DevConf::default())
        .context("failed to configure device")?;
    dev.vchan_setup(
        0,
        VchanConf {
            nb_desc: config.ring_size,
            options: VchanOptions {
                short_fd: config.short_fd,
                pre_populate: config.pre_populate,
                debug_dump: false,
            },
            ..Default::default()
        },
    )
    .context("failed to set up vchan")?;
    dev.start().context("failed to start device")?;
    Ok(dev)
}

/// Ring the doorbell; a busy queue keeps its descriptors for the next kick
fn kick(dev: &mut Device, portal: &mut Portal) -> Result<()> {
    match dev.submit(portal, 0) {
        Ok(()) | Err(Error::HardwareBusy { .. }) => Ok(()),
        Err(err) => Err(err).context("submit failed"),
    }
}

/// Collect completions; protocol errors are counted and skipped
fn reap(dev: &mut Device, portal: &mut Portal, out: &mut [u16], errors: &mut u64) -> Result<u64> {
    match dev.completed(portal, 0, out) {
        Ok(n) => Ok(n as u64),
        Err(Error::Protocol(err)) => {
            warn!("qdma-perf: {}", err);
            *errors += 1;
            Ok(0)
        }
        Err(err) => Err(err).context("harvest failed"),
    }
}

fn worker(id: usize, config: &BenchConfig) -> Result<WorkerResult> {
    let len = config.buf_size * config.nr_buf;
    let src: Vec<u8> = (0..len).map(|i| ((i + id) % 251) as u8).collect();
    let mut dst = vec![0u8; len];
    let src_base = src.as_ptr() as u64;
    let dst_base = dst.as_mut_ptr() as u64;

    // SAFETY: every job addresses the disjoint `src` and `dst` buffers, which
    // outlive the device and its queue
    let hw = Arc::new(unsafe {
        LoopbackQueue::new(id as u32, config.ring_size).with_memory_copy()
    });
    let mut dev = open_device(id, config, hw)?;
    let mut portal = Portal::new(id as u32);

    let jobs: Vec<Job> = (0..config.nr_buf)
        .map(|buf| Job::new(config, buf, src_base, dst_base))
        .collect();
    let mut out = vec![0u16; config.ring_size];
    let mut completions = 0u64;
    let mut errors = 0u64;
    let mut issued = 0usize;
    let mut unkicked = 0usize;

    let start = Instant::now();
    while start.elapsed() < config.duration {
        let job = &jobs[issued % jobs.len()];
        let flags = if unkicked + 1 >= config.kick_batch {
            OpFlags::SUBMIT
        } else {
            OpFlags::empty()
        };

        let result = if config.sg_entries > 0 {
            dev.copy_sg(&mut portal, 0, &job.src, &job.dst, None, flags)
        } else {
            dev.copy(
                &mut portal,
                0,
                job.src[0].addr,
                job.dst[0].addr,
                job.src[0].len,
                flags,
            )
        };

        match result {
            Ok(_) => {
                issued += 1;
                unkicked = if flags.contains(OpFlags::SUBMIT) {
                    0
                } else {
                    unkicked + 1
                };
            }
            Err(err) if err.is_retryable() => {
                kick(&mut dev, &mut portal)?;
                unkicked = 0;
                completions += reap(&mut dev, &mut portal, &mut out, &mut errors)?;
            }
            Err(err) => return Err(err).context("enqueue failed"),
        }
    }

    // Wait for the tail of the run
    let mut polls = 0;
    while dev.stats(Some(0))?.in_flight() > 0 {
        if polls == DRAIN_POLLS {
            bail!(
                "worker {}: {} operations never completed",
                id,
                dev.stats(Some(0))?.in_flight()
            );
        }
        kick(&mut dev, &mut portal)?;
        completions += reap(&mut dev, &mut portal, &mut out, &mut errors)?;
        polls += 1;
    }
    let elapsed = start.elapsed();

    debug!("qdma-perf: worker {} {}", id, dev.stats(Some(0))?);
    dev.stop()?;
    dev.close()?;

    let verified = config.verify.then(|| {
        let copied = issued.min(config.nr_buf) * config.buf_size;
        src[..copied] == dst[..copied]
    });
    if verified == Some(false) {
        warn!("qdma-perf: worker {} destination mismatch", id);
    }

    let bytes_per_op = (config.buf_size / config.entries_per_job()) as u64;
    Ok(WorkerResult {
        worker: id,
        ops: completions,
        bytes: completions * bytes_per_op,
        errors,
        elapsed,
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(sg_entries: usize) -> BenchConfig {
        BenchConfig {
            workers: 2,
            duration: Duration::from_millis(20),
            buf_size: 1024,
            nr_buf: 16,
            kick_batch: 4,
            ring_size: 64,
            sg_entries,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(BenchConfig::default().validate().is_ok());
        assert!(BenchConfig {
            buf_size: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(BenchConfig {
            sg_entries: 3,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(BenchConfig {
            sg_entries: MAX_SG + 1,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_job_split() {
        let config = BenchConfig {
            buf_size: 4096,
            sg_entries: 4,
            ..Default::default()
        };
        let job = Job::new(&config, 2, 0x10000, 0x80000);
        assert_eq!(job.src.len(), 4);
        assert_eq!(job.src[0], SgBuf::new(0x10000 + 8192, 1024));
        assert_eq!(job.dst[3], SgBuf::new(0x80000 + 8192 + 3072, 1024));
    }

    #[test]
    fn test_plain_copy_run() {
        let results = run(&quick(0)).expect("benchmark failed");
        assert_eq!(results.workers.len(), 2);
        assert!(results.total_ops() > 0);
        assert!(results.verified());
        assert_eq!(results.total_bytes(), results.total_ops() * 1024);
    }

    #[test]
    fn test_sg_copy_run() {
        let results = run(&quick(4)).expect("benchmark failed");
        assert!(results.total_ops() > 0);
        assert_eq!(results.total_ops() % 4, 0);
        assert!(results.verified());
    }
}
