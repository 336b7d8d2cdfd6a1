//! Periodic reporters: the SLA report file and the load balancer statistics

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use library_core::Config;
use tracing::{error, info};

use crate::balancer::LoadBalancer;
use crate::lifecycle::ShutdownSignal;
use crate::sla::{SlaTracker, QUEUE_DEPTH_TARGET, UPTIME_TARGET};

const RULE: &str = "=====================================";

fn yes_no(met: bool) -> &'static str {
    if met {
        "YES"
    } else {
        "NO"
    }
}

/// Render one SLA report as plain text
pub fn render_sla_report(sla: &SlaTracker, config: &Config, at: DateTime<Local>) -> String {
    let status = sla.status();
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(out);
    let _ = writeln!(out, "SLA Report - {}", at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Environment: {}", config.environment);
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out);
    let _ = writeln!(out, "Reservation Processing SLA (Target: 95% < 2 seconds):");
    let _ = writeln!(out, "- 95th Percentile: {:.3} seconds", status.p95);
    let _ = writeln!(out, "- Average Time: {:.3} seconds", status.average);
    let _ = writeln!(out, "- Total Processed: {}", status.total_processed);
    let _ = writeln!(out, "- SLA Met: {}", yes_no(status.sla_met));
    let _ = writeln!(out);
    let _ = writeln!(out, "System Availability SLA (Target: {UPTIME_TARGET}% uptime):");
    let _ = writeln!(out, "- Current Uptime: {:.2}%", status.uptime_percentage);
    let _ = writeln!(out, "- SLA Met: {}", yes_no(status.uptime_within_target()));
    let _ = writeln!(out);
    let _ = writeln!(out, "Queue Depth SLA (Target: < {QUEUE_DEPTH_TARGET} pending):");
    let _ = writeln!(out, "- Current Queue: {}", status.queue_depth);
    let _ = writeln!(out, "- SLA Met: {}", yes_no(status.queue_within_target()));
    let _ = writeln!(out);
    let _ = writeln!(out, "Configuration:");
    let _ = writeln!(out, "- Handler Threads: {}", config.handler_threads);
    let _ = writeln!(out, "- Cache Size: {}", config.cache_size);
    let _ = writeln!(out, "- Batch Interval: {}s", config.batch_interval.as_secs_f64());
    let _ = writeln!(out, "- Processing Delay: {}s", config.processing_delay.as_secs_f64());
    let _ = writeln!(out);
    let _ = writeln!(out, "{RULE}");
    out
}

/// Append `report` to the file at `path`, creating it if needed
pub fn append_report(path: &Path, report: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(report.as_bytes())
}

/// Append an SLA report to `config.sla_report_path` every
/// `config.sla_report_interval` until shutdown
pub fn spawn_sla_reporter(
    sla: Arc<SlaTracker>,
    config: Config,
    shutdown: ShutdownSignal,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("sla-reporter".into())
        .spawn(move || {
            let path: PathBuf = config.sla_report_path.clone();
            while !shutdown.wait(config.sla_report_interval) {
                let report = render_sla_report(&sla, &config, Local::now());
                match append_report(&path, &report) {
                    Ok(()) => info!(path = %path.display(), "SLA report generated"),
                    Err(e) => error!(path = %path.display(), error = %e, "error generating SLA report"),
                }
            }
        })
}

/// Log every backend's counters every `interval` until shutdown
pub fn spawn_balancer_reporter(
    balancer: Arc<LoadBalancer>,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("balancer-reporter".into())
        .spawn(move || {
            while !shutdown.wait(interval) {
                for server in balancer.stats() {
                    info!(
                        backend = %server.address,
                        requests = server.requests,
                        errors = server.errors,
                        error_rate = %format!("{:.1}%", server.error_rate()),
                        "load balancer stats"
                    );
                }
            }
        })
}
