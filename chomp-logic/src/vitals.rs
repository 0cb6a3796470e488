use std::time::Instant;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

/// Per-acquisition measurements attached to every loader result and
/// consumed by `monitor` ingesters.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RequestVitals {
    pub latency_ms: f64,
    pub response_bytes: u64,
    pub status_code: u16,
    pub field_count: u32,
}

pub struct VitalsTimer {
    started: Instant,
}

impl VitalsTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn stop(self, response_bytes: u64, status_code: u16, field_count: u32) -> RequestVitals {
        RequestVitals {
            latency_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            response_bytes,
            status_code,
            field_count,
        }
    }
}

/// Point-in-time process measurements for monitor rows.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProcessVitals {
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_written_bytes: u64,
}

pub fn process_vitals() -> ProcessVitals {
    let pid = Pid::from_u32(std::process::id());
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_cpu().with_memory().with_disk_usage()),
    );
    match system.process(pid) {
        Some(process) => {
            let disk = process.disk_usage();
            ProcessVitals {
                cpu_percent: process.cpu_usage() as f64,
                rss_bytes: process.memory(),
                disk_read_bytes: disk.total_read_bytes,
                disk_written_bytes: disk.total_written_bytes,
            }
        }
        None => ProcessVitals::default(),
    }
}
