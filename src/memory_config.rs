use sysinfo::System;
use tracing::info;

/// Host resources at one point in time, used for slot sizing and heartbeats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSnapshot {
    pub cpus: usize,
    pub total_memory: u64,
    pub used_memory: u64,
    pub load_one: f64,
}

/// Holds one `System` so repeated samples only refresh memory and CPU.
pub struct HostSampler {
    sys: System,
}

impl HostSampler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    pub fn sample(&mut self) -> HostSnapshot {
        self.sys.refresh_memory();
        self.sys.refresh_cpu();

        let (used_memory, total_memory) = normalize_sysinfo_mem(self.sys.total_memory(), self.sys.used_memory());
        HostSnapshot {
            cpus: self.sys.cpus().len().max(1),
            total_memory,
            used_memory,
            load_one: System::load_average().one,
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSnapshot {
    /// One-off sample.
    pub fn sample() -> Self {
        HostSampler::new().sample()
    }

    /// Fraction of physical memory in use, 0.0 when unknown.
    pub fn memory_fraction(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        self.used_memory as f64 / self.total_memory as f64
    }
}

/// Worker slot sizing for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotBudget {
    pub parallelism: usize,
    pub cpu_bound: usize,
    pub memory_bound: usize,
}

impl SlotBudget {
    /// `min(floor(factor * cpus), floor(total_memory / slot_memory))`, never below one.
    pub fn derive(cpus: usize, total_memory: u64, factor: f64, slot_memory: u64) -> Self {
        let cpu_bound = (factor * cpus as f64).floor().max(0.0) as usize;
        let memory_bound = if slot_memory == 0 {
            usize::MAX
        } else {
            (total_memory / slot_memory) as usize
        };
        Self {
            parallelism: cpu_bound.min(memory_bound).max(1),
            cpu_bound,
            memory_bound,
        }
    }

    pub fn for_host(host: &HostSnapshot, factor: f64, slot_memory: u64) -> Self {
        let budget = Self::derive(host.cpus, host.total_memory, factor, slot_memory);
        info!(
            cpus = host.cpus,
            total_mib = host.total_memory / 1_048_576,
            slot_mib = slot_memory / 1_048_576,
            cpu_bound = budget.cpu_bound,
            memory_bound = budget.memory_bound,
            parallelism = budget.parallelism,
            "sized worker pool"
        );
        budget
    }
}

/// sysinfo has reported KiB on some versions and bytes on others; settle on bytes.
fn normalize_sysinfo_mem(total_raw: u64, used_raw: u64) -> (u64, u64) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            if let Some(mem_total_kib) = meminfo
                .lines()
                .find(|l| l.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok())
            {
                if within_10_pct(total_raw as f64, mem_total_kib as f64) {
                    return (used_raw.saturating_mul(1024), total_raw.saturating_mul(1024));
                }
            }
        }
    }
    (used_raw, total_raw)
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn within_10_pct(a: f64, b: f64) -> bool {
    a.max(b) > 0.0 && (a - b).abs() / a.max(b) <= 0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_cpu_bound_wins_on_large_memory() {
        let budget = SlotBudget::derive(8, 64 * GIB, 0.5, 614 * 1024 * 1024);
        assert_eq!(budget.parallelism, 4);
    }

    #[test]
    fn test_memory_bound_wins_on_small_memory() {
        let budget = SlotBudget::derive(16, 2 * GIB, 1.0, GIB);
        assert_eq!(budget.memory_bound, 2);
        assert_eq!(budget.parallelism, 2);
    }

    #[test]
    fn test_parallelism_never_zero() {
        assert_eq!(SlotBudget::derive(1, 100, 0.5, GIB).parallelism, 1);
    }

    #[test]
    fn test_host_sample_is_sane() {
        let host = HostSnapshot::sample();
        assert!(host.cpus >= 1);
        assert!(host.memory_fraction() >= 0.0);
    }

    #[test]
    fn test_sampler_reuses_its_system() {
        let mut sampler = HostSampler::new();
        let first = sampler.sample();
        let second = sampler.sample();
        assert_eq!(first.cpus, second.cpus);
        assert_eq!(first.total_memory, second.total_memory);
    }
}
