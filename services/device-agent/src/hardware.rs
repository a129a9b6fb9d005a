//! Host hardware probing.
//!
//! CPU and memory figures feed the profile evaluator as variables and the
//! heartbeat's hardware summary. Enrolment sends the same summary.

use flotta_profile::{Value, Variables};
use serde::Serialize;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A CPU and memory sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemResources {
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_cores,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
        }
    }

    /// Share of memory in use, in percent.
    pub fn memory_used_percent(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 0.0;
        }
        let used = self.total_memory_bytes.saturating_sub(self.available_memory_bytes);
        used as f64 * 100.0 / self.total_memory_bytes as f64
    }

    /// Variables for profile expressions.
    pub fn to_variables(&self) -> Variables {
        let mut vars = Variables::new();
        vars.insert("cpu_cores".into(), Value::from(i64::from(self.cpu_cores)));
        vars.insert(
            "memory_total_gib".into(),
            Value::from(self.total_memory_bytes as f64 / GIB),
        );
        vars.insert(
            "memory_available_gib".into(),
            Value::from(self.available_memory_bytes as f64 / GIB),
        );
        vars.insert(
            "memory_used_percent".into(),
            Value::from(self.memory_used_percent()),
        );
        vars
    }
}

/// Hardware summary reported to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareInfo {
    pub hostname: String,
    pub architecture: String,
    pub operating_system: String,
    pub cpu_cores: u32,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
}

impl HardwareInfo {
    pub fn collect() -> Self {
        Self::from_resources(&SystemResources::measure())
    }

    pub fn from_resources(resources: &SystemResources) -> Self {
        Self {
            hostname: hostname(),
            architecture: std::env::consts::ARCH.to_string(),
            operating_system: std::env::consts::OS.to_string(),
            cpu_cores: resources.cpu_cores,
            memory_total_bytes: resources.total_memory_bytes,
            memory_available_bytes: resources.available_memory_bytes,
        }
    }
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let parsed = parse_meminfo(&meminfo);
        if parsed.0 > 0 {
            return parsed;
        }
    }
    sysconf_memory()
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    sysconf_memory()
}

fn sysconf_memory() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = page_size as u64 * total_pages as u64;
            return (total, total / 2);
        }
    }

    (0, 0)
}

/// Total and available bytes from `/proc/meminfo` content.
fn parse_meminfo(content: &str) -> (u64, u64) {
    const KB_TO_BYTES: u64 = 1024;
    let mut total = 0;
    let mut available = None;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0) * KB_TO_BYTES;
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = Some(value),
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    (total, available.unwrap_or(free + buffers + cached))
}
