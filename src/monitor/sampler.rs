//! Raw memory/CPU sampling
//!
//! On Linux the sampler keeps `/proc/meminfo` and `/proc/stat` open for the
//! life of the process and re-reads them from offset 0 on every call. Other
//! platforms fall back to `sysinfo`. Tests inject scripted samplers.

/// Cumulative CPU jiffies from the aggregate `cpu ` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    /// idle + iowait
    pub idle: u64,
    /// Sum of the first eight fields
    pub total: u64,
}

impl CpuTimes {
    /// Busy fraction across two consecutive readings, as a percent.
    /// A zero delta (first reading, or a clock that did not move) is 0.
    pub fn busy_percent_since(&self, prev: &CpuTimes) -> f64 {
        let total_delta = self.total.saturating_sub(prev.total);
        if total_delta == 0 {
            return 0.0;
        }
        let idle_delta = self.idle.saturating_sub(prev.idle);
        (1.0 - idle_delta as f64 / total_delta as f64) * 100.0
    }
}

/// Source of raw resource readings. `&mut self` because platform samplers
/// hold reusable file handles or refresh state.
pub trait ResourceSampler: Send {
    /// System memory in use, percent of total. 0.0 when unreadable.
    fn memory_percent(&mut self) -> f64;

    /// Cumulative CPU times since boot. Zeroed when unreadable.
    fn cpu_times(&mut self) -> CpuTimes;
}

/// Platform-default sampler.
pub fn platform_sampler() -> Box<dyn ResourceSampler> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::ProcSampler::open())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(fallback::SysinfoSampler::new())
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use super::{CpuTimes, ResourceSampler};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};
    use std::sync::Mutex;
    use tracing::warn;

    /// `/proc`-backed sampler. The two file handles are opened once and
    /// guarded by a dedicated lock; each read seeks back to the start.
    pub struct ProcSampler {
        meminfo: Mutex<Option<File>>,
        stat: Mutex<Option<File>>,
    }

    impl ProcSampler {
        pub fn open() -> Self {
            let meminfo = File::open("/proc/meminfo")
                .map_err(|e| warn!("cannot open /proc/meminfo: {e}"))
                .ok();
            let stat = File::open("/proc/stat")
                .map_err(|e| warn!("cannot open /proc/stat: {e}"))
                .ok();
            Self {
                meminfo: Mutex::new(meminfo),
                stat: Mutex::new(stat),
            }
        }

        fn read_rewound(slot: &Mutex<Option<File>>, buf: &mut String) -> bool {
            let mut guard = slot.lock().unwrap();
            let Some(file) = guard.as_mut() else {
                return false;
            };
            buf.clear();
            if file.seek(SeekFrom::Start(0)).is_err() {
                return false;
            }
            file.read_to_string(buf).is_ok()
        }
    }

    impl ResourceSampler for ProcSampler {
        fn memory_percent(&mut self) -> f64 {
            let mut raw = String::with_capacity(4096);
            if !Self::read_rewound(&self.meminfo, &mut raw) {
                return 0.0;
            }
            parse_meminfo_percent(&raw)
        }

        fn cpu_times(&mut self) -> CpuTimes {
            let mut raw = String::with_capacity(1024);
            if !Self::read_rewound(&self.stat, &mut raw) {
                return CpuTimes::default();
            }
            parse_cpu_line(&raw)
        }
    }

    /// used = MemTotal - (MemFree + Buffers + Cached + SReclaimable - Shmem)
    pub fn parse_meminfo_percent(raw: &str) -> f64 {
        let mut total = 0u64;
        let mut free = 0u64;
        let mut buffers = 0u64;
        let mut cached = 0u64;
        let mut sreclaimable = 0u64;
        let mut shmem = 0u64;

        for line in raw.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse().ok()) else {
                continue;
            };
            match key.trim() {
                "MemTotal" => total = value,
                "MemFree" => free = value,
                "Buffers" => buffers = value,
                "Cached" => cached = value,
                "SReclaimable" => sreclaimable = value,
                "Shmem" => shmem = value,
                _ => {}
            }
        }

        if total == 0 {
            return 0.0;
        }
        let available = (free + buffers + cached + sreclaimable) as i64 - shmem as i64;
        let used = total as i64 - available;
        (used as f64 / total as f64) * 100.0
    }

    /// First eight fields of the aggregate `cpu ` line; idle = fields 4+5.
    pub fn parse_cpu_line(raw: &str) -> CpuTimes {
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("cpu ") {
                let fields: Vec<u64> = rest
                    .split_whitespace()
                    .take(8)
                    .filter_map(|f| f.parse().ok())
                    .collect();
                if fields.len() == 8 {
                    return CpuTimes {
                        idle: fields[3] + fields[4],
                        total: fields.iter().sum(),
                    };
                }
                break;
            }
        }
        CpuTimes::default()
    }

}

#[cfg(not(target_os = "linux"))]
pub mod fallback {
    use super::{CpuTimes, ResourceSampler};
    use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

    /// Portable sampler for platforms without `/proc`.
    pub struct SysinfoSampler {
        system: System,
        synthetic_jiffies: u64,
    }

    impl SysinfoSampler {
        pub fn new() -> Self {
            let system = System::new_with_specifics(
                RefreshKind::new()
                    .with_memory(MemoryRefreshKind::everything())
                    .with_cpu(CpuRefreshKind::everything()),
            );
            Self {
                system,
                synthetic_jiffies: 0,
            }
        }
    }

    impl ResourceSampler for SysinfoSampler {
        fn memory_percent(&mut self) -> f64 {
            self.system.refresh_memory();
            let total = self.system.total_memory();
            if total == 0 {
                return 0.0;
            }
            (self.system.used_memory() as f64 / total as f64) * 100.0
        }

        fn cpu_times(&mut self) -> CpuTimes {
            // sysinfo reports usage directly; synthesize a jiffy pair so the
            // delta math downstream yields that same percentage.
            self.system.refresh_cpu();
            let usage = f64::from(self.system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);
            const STEP: u64 = 1000;
            self.synthetic_jiffies += STEP;
            CpuTimes {
                idle: self.synthetic_jiffies - (usage * STEP as f64 / 100.0) as u64,
                total: self.synthetic_jiffies,
            }
        }
    }
}

/// Scripted sampler for tests and fault injection.
pub mod testing {
    use super::{CpuTimes, ResourceSampler};
    use std::collections::VecDeque;

    /// Replays a fixed script of `(memory%, cpu%)` pairs, then holds the
    /// last one. CPU percentages are synthesized into jiffy pairs so the
    /// monitor's delta computation reproduces them exactly.
    pub struct ScriptedSampler {
        script: VecDeque<(f64, f64)>,
        current: (f64, f64),
        jiffies: u64,
        busy_jiffies: u64,
    }

    impl ScriptedSampler {
        pub fn new(samples: impl IntoIterator<Item = (f64, f64)>) -> Self {
            Self {
                script: samples.into_iter().collect(),
                current: (0.0, 0.0),
                jiffies: 0,
                busy_jiffies: 0,
            }
        }
    }

    impl ResourceSampler for ScriptedSampler {
        // The monitor reads memory first, which is where the script advances.
        fn memory_percent(&mut self) -> f64 {
            if let Some(next) = self.script.pop_front() {
                self.current = next;
            }
            self.current.0
        }

        fn cpu_times(&mut self) -> CpuTimes {
            const STEP: u64 = 10_000;
            self.jiffies += STEP;
            self.busy_jiffies += (self.current.1.clamp(0.0, 100.0) * STEP as f64 / 100.0) as u64;
            CpuTimes {
                idle: self.jiffies - self.busy_jiffies,
                total: self.jiffies,
            }
        }
    }
}
