//! Process statistics querying.
//!
//! This crate provides a way to query the CPU and memory usage of the current process, which a mesh node exposes so
//! that benchmark harnesses can observe the synthetic load it generates.
//!
//! ## CPU
//!
//! CPU usage is derived from `getrusage(2)` on all Unix platforms. Each call to [`Querier::cpu_percent`] reports the
//! share of a single core consumed by the process since the previous call (or since the querier was created), so the
//! value can exceed 100 on multi-core hosts when more than one core is busy.
//!
//! ## Memory
//!
//! - Linux: `/proc/self/statm` is read, which holds lazily-updated memory statistics, expressed in pages. (Available in
//!   Linux 2.6+)
//! - macOS: the kernel is queried directly for Mach task information.
//!
//! Other platforms report `None` for every statistic.
use std::time::Instant;

#[cfg(unix)]
mod cpu;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
use linux::memory_sizes;

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(target_os = "macos")]
use darwin::memory_sizes;

#[cfg(all(not(target_os = "linux"), not(target_os = "macos")))]
fn memory_sizes() -> Option<MemorySizes> {
    None
}

/// Point-in-time memory sizes of the process, in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemorySizes {
    /// Total virtual memory mapped by the process.
    pub virtual_size: u64,

    /// Portion of the process memory currently resident in RAM.
    pub resident_size: u64,
}

struct CpuSample {
    at: Instant,
    cpu_time_micros: u64,
}

/// A process statistics querier.
pub struct Querier {
    last_cpu_sample: Option<CpuSample>,
}

impl Querier {
    /// Gets the virtual memory size of this process, in bytes.
    ///
    /// If the value cannot be determined, `None` is returned.
    pub fn virtual_memory_size(&mut self) -> Option<u64> {
        memory_sizes().map(|sizes| sizes.virtual_size)
    }

    /// Gets the resident set size of this process, in bytes.
    ///
    /// If the value cannot be determined, `None` is returned.
    pub fn resident_set_size(&mut self) -> Option<u64> {
        memory_sizes().map(|sizes| sizes.resident_size)
    }

    /// Gets the CPU usage of this process, as a percentage of a single core, since the last call.
    ///
    /// The first call measures from the moment the querier was created. If CPU time cannot be determined on this
    /// platform, `None` is returned.
    pub fn cpu_percent(&mut self) -> Option<f64> {
        let current = CpuSample {
            at: Instant::now(),
            cpu_time_micros: process_cpu_time_micros()?,
        };

        let percent = match self.last_cpu_sample.as_ref() {
            Some(previous) => {
                let wall_micros = current.at.duration_since(previous.at).as_micros() as f64;
                let cpu_micros = current.cpu_time_micros.saturating_sub(previous.cpu_time_micros) as f64;
                if wall_micros > 0.0 {
                    cpu_micros / wall_micros * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        self.last_cpu_sample = Some(current);
        Some(percent)
    }
}

impl Default for Querier {
    fn default() -> Self {
        let last_cpu_sample = process_cpu_time_micros().map(|cpu_time_micros| CpuSample {
            at: Instant::now(),
            cpu_time_micros,
        });

        Self { last_cpu_sample }
    }
}

#[cfg(unix)]
fn process_cpu_time_micros() -> Option<u64> {
    cpu::process_cpu_time_micros()
}

#[cfg(not(unix))]
fn process_cpu_time_micros() -> Option<u64> {
    None
}
