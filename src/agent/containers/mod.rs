pub mod logs;
pub mod stats;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bollard::models::ContainerSummary;
use bollard::query_parameters::{InspectContainerOptions, ListContainersOptions, StatsOptions};
use futures::StreamExt;
use globset::{Glob, GlobSet, GlobSetBuilder};
use semver::Version;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::delta::DeltaTracker;
use crate::config::AgentConfig;
use crate::types::ContainerStats;

use self::stats::{ContainerBaseline, RawSample};

/// Containers polled concurrently per sampling round (engines ≥ 25 only;
/// older engines have a one-shot bug that requires an uncapped fan-out).
const STATS_CONCURRENCY: usize = 5;

/// Container network rates above this are counter glitches; the value is
/// zeroed and a warning logged.
pub const MAX_NETWORK_SPEED_BPS: u64 = 5 * 1024 * 1024 * 1024;

/// Engine major version where the concurrency cap applies.
const CAP_MIN_MAJOR: u64 = 25;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("engine error: {0}")]
    Engine(#[from] bollard::errors::Error),
    #[error("stats request timed out")]
    Timeout,
    #[error("stats stream ended without a sample")]
    EmptyStats,
    #[error("implausible stats sample: {0}")]
    BadSample(&'static str),
    #[error("log frame of {0} bytes exceeds the frame cap")]
    FrameTooLarge(usize),
}

/// Per-interval tracker pair for container network counters, keyed by the
/// container's short id.
struct IntervalNetTracker {
    sent: DeltaTracker<String, u64>,
    recv: DeltaTracker<String, u64>,
    last_cycle: Instant,
}

impl IntervalNetTracker {
    fn new() -> Self {
        Self {
            sent: DeltaTracker::new(),
            recv: DeltaTracker::new(),
            last_cycle: Instant::now(),
        }
    }
}

/// One fan-out job: everything we know from the container listing.
#[derive(Debug, Clone)]
struct Job {
    id: String,
    name: String,
    image: String,
    status: String,
}

/// Result of one per-container fetch before rate computation.
struct Fetched {
    stats: ContainerStats,
    net_rx_total: u64,
    net_tx_total: u64,
}

/// Collects container metrics from a Docker-compatible engine.
pub struct ContainerManager {
    docker: bollard::Docker,
    semaphore: Arc<Semaphore>,
    cap_concurrency: bool,
    exclude: Option<GlobSet>,
    timeout: Duration,
    baselines: RwLock<HashMap<String, ContainerBaseline>>,
    net_trackers: Mutex<HashMap<u16, IntervalNetTracker>>,
}

impl ContainerManager {
    /// Connect to the engine and probe its version. Fails when no engine is
    /// reachable — the caller treats that as "no container metrics", not a
    /// startup error.
    pub async fn new(config: &AgentConfig) -> Result<Self> {
        let timeout_secs = config.docker_timeout_ms.div_ceil(1000).max(1);
        let docker = connect(config.docker_host.as_deref(), timeout_secs)?;

        let version = docker
            .version()
            .await
            .context("Failed to get engine version — is the engine socket reachable?")?;
        let version_str = version.version.unwrap_or_default();
        let cap_concurrency = version_requires_cap(&version_str);

        info!(
            engine_version = %version_str,
            cap_concurrency,
            "Connected to container engine"
        );

        Ok(Self {
            docker,
            semaphore: Arc::new(Semaphore::new(STATS_CONCURRENCY)),
            cap_concurrency,
            exclude: build_exclusions(&config.exclude_containers),
            timeout: Duration::from_millis(config.docker_timeout_ms),
            baselines: RwLock::new(HashMap::new()),
            net_trackers: Mutex::new(HashMap::new()),
        })
    }

    /// One sampling round: list, filter, fan out one-shot stats requests,
    /// retry decode failures once, prune state for vanished containers, and
    /// cycle this interval's network trackers.
    pub async fn collect(self: &Arc<Self>, interval_ms: u16) -> Result<Vec<ContainerStats>> {
        let list = self
            .docker
            .list_containers(Some(ListContainersOptions::default()))
            .await
            .context("Failed to list containers")?;

        let mut valid_ids: HashSet<String> = HashSet::with_capacity(list.len());
        let mut jobs: Vec<Job> = Vec::with_capacity(list.len());

        for summary in &list {
            let Some(job) = job_from_summary(summary) else {
                continue;
            };
            valid_ids.insert(job.id.clone());

            // A container up for under a minute may have been recreated with
            // the same id prefix; its counters restart from zero.
            if stats::is_recently_started(&job.status) {
                self.reset_container(&job.id).await;
            }

            if let Some(exclude) = &self.exclude {
                if exclude.is_match(&job.name) {
                    debug!(container = %job.name, "Excluded by pattern");
                    continue;
                }
            }
            jobs.push(job);
        }

        // First pass: concurrent fan-out.
        let mut join = JoinSet::new();
        for job in jobs {
            let manager = self.clone();
            join.spawn(async move {
                let id = job.id.clone();
                let result = manager.fetch_one(job.clone()).await;
                (job, result.map_err(|e| (id, e)))
            });
        }

        let mut fetched: Vec<Fetched> = Vec::new();
        let mut retry_jobs: Vec<Job> = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((_, Ok(f))) => fetched.push(f),
                Ok((job, Err((id, e)))) => {
                    warn!(container = %job.name, error = %e, "Container stats failed — will retry once");
                    self.reset_container(&id).await;
                    retry_jobs.push(job);
                }
                Err(e) => warn!(error = %e, "Container stats task panicked"),
            }
        }

        // Single retry pass, sequential: these already failed once.
        for job in retry_jobs {
            match self.fetch_one(job.clone()).await {
                Ok(f) => fetched.push(f),
                Err(e) => {
                    warn!(container = %job.name, error = %e, "Container stats retry failed");
                    self.reset_container(&job.id).await;
                }
            }
        }

        // Prune state for containers gone from the engine listing.
        self.baselines
            .write()
            .await
            .retain(|id, _| valid_ids.contains(id));

        // Rates + cycle, serialized under the tracker lock.
        let mut trackers = self.net_trackers.lock().await;
        let tracker = trackers
            .entry(interval_ms)
            .or_insert_with(IntervalNetTracker::new);
        let elapsed_ms = tracker.last_cycle.elapsed().as_millis() as u64;

        let mut out = Vec::with_capacity(fetched.len());
        for mut f in fetched {
            tracker.recv.set(f.stats.id.clone(), f.net_rx_total);
            tracker.sent.set(f.stats.id.clone(), f.net_tx_total);
            let recv_bps = rate_bps(tracker.recv.delta(&f.stats.id), elapsed_ms);
            let sent_bps = rate_bps(tracker.sent.delta(&f.stats.id), elapsed_ms);
            match (recv_bps, sent_bps) {
                (Some(recv), Some(sent)) => {
                    f.stats.net_recv_bps = recv;
                    f.stats.net_sent_bps = sent;
                }
                _ => warn!(
                    container = %f.stats.name,
                    "Implausible container network rate — resetting"
                ),
            }
            out.push(f.stats);
        }
        tracker.sent.cycle();
        tracker.recv.cycle();
        tracker.last_cycle = Instant::now();

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// One-shot stats request for a single container, semaphore-capped on
    /// modern engines.
    async fn fetch_one(self: &Arc<Self>, job: Job) -> Result<Fetched, ContainerError> {
        let _permit = if self.cap_concurrency {
            match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return Err(ContainerError::BadSample("semaphore closed")),
            }
        } else {
            None
        };

        let options = StatsOptions {
            stream: false,
            one_shot: true,
            ..Default::default()
        };
        let response = tokio::time::timeout(
            self.timeout,
            self.docker.stats(&job.id, Some(options)).next(),
        )
        .await
        .map_err(|_| ContainerError::Timeout)?
        .ok_or(ContainerError::EmptyStats)??;

        let value = serde_json::to_value(&response)
            .map_err(|_| ContainerError::BadSample("stats response not serializable"))?;
        let raw = RawSample::from_value(&value);

        let (cpu_pct, mem_bytes) = {
            let mut baselines = self.baselines.write().await;
            let baseline = baselines.entry(job.id.clone()).or_default();
            let cpu = stats::cpu_percent(baseline, &raw)?;
            let mem = stats::memory_usage(&raw)?;
            (cpu, mem)
        };

        let (status, health) = stats::parse_status(&job.status);

        Ok(Fetched {
            stats: ContainerStats {
                id: job.id,
                name: job.name,
                image: job.image,
                status,
                health,
                cpu_pct,
                mem_bytes,
                net_sent_bps: 0,
                net_recv_bps: 0,
            },
            net_rx_total: raw.net_rx,
            net_tx_total: raw.net_tx,
        })
    }

    /// Drop all stored state for a container so its next sample starts from
    /// scratch.
    async fn reset_container(&self, id: &str) {
        self.baselines.write().await.remove(id);
        let trackers = self.net_trackers.lock().await;
        for tracker in trackers.values() {
            tracker.sent.remove(&id.to_string());
            tracker.recv.remove(&id.to_string());
        }
    }

    /// Full engine-side detail for one container, as JSON (request-driven).
    pub async fn inspect(&self, id: &str) -> Result<String, ContainerError> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        serde_json::to_string(&detail)
            .map_err(|_| ContainerError::BadSample("inspect response not serializable"))
    }

}

/// Byte-counter delta → bytes per second. None flags a rate beyond the
/// plausibility ceiling; the caller zeroes the field and warns. A zero
/// window (first round for this interval key) reads as zero, never an
/// error.
fn rate_bps(delta: u64, elapsed_ms: u64) -> Option<u64> {
    if elapsed_ms == 0 {
        return Some(0);
    }
    let rate = delta * 1000 / elapsed_ms;
    (rate <= MAX_NETWORK_SPEED_BPS).then_some(rate)
}

fn connect(docker_host: Option<&str>, timeout_secs: u64) -> Result<bollard::Docker> {
    let docker = match docker_host {
        Some(host) if host.starts_with("unix://") || host.starts_with('/') => {
            let path = host.strip_prefix("unix://").unwrap_or(host);
            bollard::Docker::connect_with_unix(path, timeout_secs, bollard::API_DEFAULT_VERSION)
        }
        Some(host) => {
            bollard::Docker::connect_with_http(host, timeout_secs, bollard::API_DEFAULT_VERSION)
        }
        // Honors DOCKER_HOST and falls back to the default socket.
        None => bollard::Docker::connect_with_local_defaults(),
    };
    docker.context("Failed to connect to container engine")
}

/// Engines at or above 25.0.0 get the capped fan-out; anything older (or
/// unparseable in a way that suggests older) runs uncapped because their
/// one-shot endpoint misbehaves under interleaved requests.
fn version_requires_cap(version: &str) -> bool {
    parse_engine_version(version)
        .map(|v| v.major >= CAP_MIN_MAJOR)
        .unwrap_or(true)
}

fn parse_engine_version(version: &str) -> Option<Version> {
    let cleaned = version.trim().trim_start_matches('v');
    Version::parse(cleaned).ok().or_else(|| {
        // Some engines report "25.0" — pad to a full triple.
        let mut parts = cleaned.splitn(2, '-');
        let core = parts.next()?;
        let nums: Vec<&str> = core.split('.').collect();
        match nums.len() {
            2 => Version::parse(&format!("{core}.0")).ok(),
            1 => Version::parse(&format!("{core}.0.0")).ok(),
            _ => None,
        }
    })
}

fn build_exclusions(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!(pattern, error = %e, "Ignoring invalid container exclusion"),
        }
    }
    builder.build().ok()
}

fn job_from_summary(summary: &ContainerSummary) -> Option<Job> {
    let id = summary.id.as_deref()?;
    let id = id.get(..12).unwrap_or(id).to_string();
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    Some(Job {
        id,
        name,
        image: summary.image.clone().unwrap_or_default(),
        status: summary.status.clone().unwrap_or_default(),
    })
}
