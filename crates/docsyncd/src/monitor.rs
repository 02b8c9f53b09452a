//! Periodic server statistics.
//!
//! Logs, per application, how many sessions are alive and how many
//! connections are attached, along with the daemon's own memory and CPU use.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::contexts::ApplicationContext;

/// Resource usage of the daemon process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessMetrics {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

impl ProcessMetrics {
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / 1024 / 1024
    }
}

/// Samples this process through sysinfo.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
        }
    }

    /// Refreshes and returns current usage.
    ///
    /// CPU usage is relative to the previous call, so the first sample
    /// usually reports 0.
    pub fn sample(&mut self) -> ProcessMetrics {
        // CPU usage is only computed by a full refresh
        self.system.refresh_all();

        self.system
            .process(self.pid)
            .map(|p| ProcessMetrics {
                memory_bytes: p.memory(),
                cpu_percent: p.cpu_usage(),
            })
            .unwrap_or_default()
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Session and connection counts of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationStats {
    pub url: String,
    pub sessions: usize,
    pub connections: usize,
}

pub fn collect_stats(apps: &[Arc<ApplicationContext>]) -> Vec<ApplicationStats> {
    apps.iter()
        .map(|app| ApplicationStats {
            url: app.url().to_string(),
            sessions: app.session_count(),
            connections: app.connection_count(),
        })
        .collect()
}

/// Spawns the stats logging task. Stops when `cancel_token` fires.
pub fn spawn_stats_task(
    apps: Vec<Arc<ApplicationContext>>,
    frequency: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ProcessMonitor::new();
        let mut tick = interval(frequency);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Baseline for the CPU measurement
        let _ = monitor.sample();

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break,

                _ = tick.tick() => {
                    log_stats(&collect_stats(&apps), monitor.sample());
                }
            }
        }

        debug!("Stats task completed");
    })
}

fn log_stats(stats: &[ApplicationStats], metrics: ProcessMetrics) {
    let sessions: usize = stats.iter().map(|s| s.sessions).sum();
    let connections: usize = stats.iter().map(|s| s.connections).sum();

    for app in stats {
        debug!(
            app = %app.url,
            sessions = app.sessions,
            connections = app.connections,
            "Application stats"
        );
    }
    info!(
        sessions,
        connections,
        memory_mb = metrics.memory_mb(),
        cpu_percent = format!("{:.1}", metrics.cpu_percent),
        "Server stats"
    );
}
