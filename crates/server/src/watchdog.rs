//! Memory watchdog
//!
//! Guards against runaway memory from long calls with many speakers. Host
//! memory readings only apply when running directly on a host: inside a
//! container the cgroup limit is authoritative, and a container without a
//! limit is left alone.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use lt_config::constants::watchdog as consts;

/// cgroup v1 reports this (or larger) when no limit is set.
const CGROUP_V1_UNLIMITED: u64 = 9_223_372_036_854_771_712;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerLimit {
    /// No cgroup files found; not containerized (or unreadable).
    NotFound,
    /// Containerized with no memory limit.
    Unlimited,
    Mb(u64),
}

/// Spawn the watchdog task. `max_rss_mb == 0` disables the hard RSS limit;
/// availability checks still run. A triggered shutdown fires `shutdown`.
pub fn spawn(max_rss_mb: u64, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            check_interval_secs = consts::CHECK_INTERVAL.as_secs(),
            min_available_mb = consts::MIN_AVAILABLE_MEMORY_MB,
            critical_available_mb = consts::CRITICAL_AVAILABLE_MEMORY_MB,
            max_rss_mb,
            "memory watchdog started"
        );
        let mut interval = tokio::time::interval(consts::CHECK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;

            if max_rss_mb > 0 {
                if let Some(rss) = current_rss_mb() {
                    if rss > max_rss_mb {
                        tracing::error!(
                            rss_mb = rss,
                            max_rss_mb,
                            "RSS limit exceeded, shutting down"
                        );
                        shutdown.notify_one();
                        return;
                    }
                }
            }

            match available_memory_mb() {
                Some(available) if available <= consts::CRITICAL_AVAILABLE_MEMORY_MB => {
                    tracing::error!(
                        available_mb = available,
                        "critically low on memory, shutting down"
                    );
                    shutdown.notify_one();
                    return;
                }
                Some(available) if available <= consts::MIN_AVAILABLE_MEMORY_MB => {
                    tracing::warn!(available_mb = available, "running low on memory");
                }
                _ => {}
            }
        }
    })
}

/// Available memory in MB: cgroup limit minus usage when containerized with
/// a limit, host MemAvailable when on a host, `None` when no reading
/// applies.
fn available_memory_mb() -> Option<u64> {
    match container_memory_limit_mb() {
        ContainerLimit::Unlimited => None,
        ContainerLimit::Mb(limit) => {
            container_memory_usage_mb().map(|usage| limit.saturating_sub(usage))
        }
        ContainerLimit::NotFound => {
            // /proc/meminfo inside a container shows host memory, which is
            // misleading without an explicit limit.
            if is_in_container() {
                return None;
            }
            let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
            parse_meminfo_available_kb(&meminfo).map(|kb| kb / 1024)
        }
    }
}

fn current_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_status_rss_kb(&status).map(|kb| kb / 1024)
}

fn is_in_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|content| cgroup_indicates_container(&content))
        .unwrap_or(false)
}

fn container_memory_limit_mb() -> ContainerLimit {
    // cgroup v2
    if let Ok(value) = std::fs::read_to_string("/sys/fs/cgroup/memory.max") {
        let value = value.trim();
        if value == "max" {
            return ContainerLimit::Unlimited;
        }
        if let Ok(bytes) = value.parse::<u64>() {
            return ContainerLimit::Mb(bytes / (1024 * 1024));
        }
    }
    // cgroup v1
    if let Ok(value) = std::fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes") {
        if let Ok(bytes) = value.trim().parse::<u64>() {
            if bytes >= CGROUP_V1_UNLIMITED {
                return ContainerLimit::Unlimited;
            }
            return ContainerLimit::Mb(bytes / (1024 * 1024));
        }
    }
    ContainerLimit::NotFound
}

fn container_memory_usage_mb() -> Option<u64> {
    for path in [
        "/sys/fs/cgroup/memory.current",
        "/sys/fs/cgroup/memory/memory.usage_in_bytes",
    ] {
        if let Ok(value) = std::fs::read_to_string(path) {
            if let Ok(bytes) = value.trim().parse::<u64>() {
                return Some(bytes / (1024 * 1024));
            }
        }
    }
    None
}

/// `VmRSS:    12345 kB` from /proc/self/status.
fn parse_status_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// `MemAvailable:    12345 kB` from /proc/meminfo.
fn parse_meminfo_available_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// Docker/LXC/Kubernetes paths in /proc/1/cgroup, or a v2 namespace root.
fn cgroup_indicates_container(content: &str) -> bool {
    if content.contains("/docker/") || content.contains("/lxc/") || content.contains("/kubepods/")
    {
        return true;
    }
    content.trim() == "0::/"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vmrss_line() {
        let status = "Name:\tlt-server\nVmPeak:\t  2000 kB\nVmRSS:\t  204800 kB\n";
        assert_eq!(parse_status_rss_kb(status), Some(204800));
        assert_eq!(parse_status_rss_kb("Name: x\n"), None);
    }

    #[test]
    fn parses_memavailable_line() {
        let meminfo = "MemTotal:  16000000 kB\nMemFree:  100 kB\nMemAvailable:  8192000 kB\n";
        assert_eq!(parse_meminfo_available_kb(meminfo), Some(8192000));
        assert_eq!(parse_meminfo_available_kb("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn detects_container_cgroups() {
        assert!(cgroup_indicates_container(
            "12:memory:/docker/abcdef0123456789\n"
        ));
        assert!(cgroup_indicates_container("1:name=systemd:/lxc/mycontainer\n"));
        assert!(cgroup_indicates_container(
            "11:memory:/kubepods/burstable/pod1/abc\n"
        ));
        assert!(cgroup_indicates_container("0::/\n"));
        assert!(!cgroup_indicates_container(
            "0::/init.scope\n1:name=systemd:/\n"
        ));
    }
}
