use std::{
    num::NonZeroUsize,
    sync::Mutex,
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytesize::ByteSize;
use process_stats::Querier;
use tracing::{debug, error};

use super::LoadProfile;

/// Default size of a single memory unit.
pub const DEFAULT_MEMORY_UNIT_SIZE: ByteSize = ByteSize::mib(32);

// Fill value for simulated memory, so every page is actually written to.
const MEMORY_FILL_BYTE: u8 = 1;

// Busy-loops sleep once per boundary of this many milliseconds of wall-clock time.
const DUTY_CYCLE_PERIOD_MS: u128 = 100;

/// A block of memory held on behalf of an in-flight request.
pub struct MemoryBlock {
    buf: Vec<u8>,
}

impl MemoryBlock {
    /// Returns the size of the block, in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if the block holds no memory.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Resource simulator.
///
/// Burns CPU time across every available core according to a duty cycle, and holds blocks of touched memory, in order
/// to reproduce the local processing cost of a mesh hop.
pub struct ResourceSimulator {
    parallelism: NonZeroUsize,
    memory_unit_bytes: u64,
    stats: Mutex<Querier>,
}

impl ResourceSimulator {
    /// Creates a new `ResourceSimulator`.
    ///
    /// `parallelism` is the number of concurrent busy-loops run by [`apply_load`][Self::apply_load], including the
    /// caller's own thread.
    pub fn new(parallelism: NonZeroUsize, memory_unit_size: ByteSize) -> Self {
        Self {
            parallelism,
            memory_unit_bytes: memory_unit_size.as_u64(),
            stats: Mutex::new(Querier::default()),
        }
    }

    /// Returns the number of concurrent busy-loops used when applying load.
    pub fn parallelism(&self) -> NonZeroUsize {
        self.parallelism
    }

    /// Runs the full local cost of a request: allocates the profile's memory, burns CPU for `process_time`, and then
    /// releases the memory.
    ///
    /// A zero `process_time` skips the CPU phase entirely rather than spinning forever.
    pub fn simulate(&self, profile: &LoadProfile, process_time: Duration) -> Duration {
        let block = self.allocate_memory(profile.memory_units);
        let elapsed = if process_time.is_zero() {
            Duration::ZERO
        } else {
            self.apply_load(profile.cpu_duty_cycle, process_time)
        };
        self.release_memory(block);

        elapsed
    }

    /// Busy-spins every available core for roughly `duration`, sleeping once per 100ms boundary so that the share of
    /// time spent spinning approximates `duty_cycle`.
    ///
    /// Returns the elapsed time observed by the calling thread.
    ///
    /// If `duration` is zero, this never returns.
    pub fn apply_load(&self, duty_cycle: f64, duration: Duration) -> Duration {
        let extra_loops = self.parallelism.get() - 1;
        debug!(duty_cycle, ?duration, parallelism = self.parallelism.get(), "Applying CPU load.");

        thread::scope(|s| {
            for _ in 0..extra_loops {
                s.spawn(|| busy_loop(duty_cycle, duration));
            }

            busy_loop(duty_cycle, duration)
        })
    }

    /// Allocates `units` memory units, writing to every byte so the memory is committed.
    ///
    /// Allocation failure aborts the process.
    pub fn allocate_memory(&self, units: u32) -> MemoryBlock {
        let requested = u64::from(units).saturating_mul(self.memory_unit_bytes);
        debug!(units, bytes = requested, "Allocating memory.");

        let mut buf = Vec::new();
        let reserved = usize::try_from(requested)
            .ok()
            .and_then(|len| buf.try_reserve_exact(len).ok().map(|()| len));
        let Some(len) = reserved else {
            error!(units, bytes = requested, "Failed to allocate simulated memory. Aborting.");
            std::process::abort();
        };

        buf.resize(len, MEMORY_FILL_BYTE);
        MemoryBlock {
            buf: std::hint::black_box(buf),
        }
    }

    /// Releases a memory block and asks the allocator to hand free pages back to the operating system.
    pub fn release_memory(&self, block: MemoryBlock) {
        let released = block.len();
        drop(block);

        // The release has to be visible in process memory statistics, so freed pages go back to the OS right away.
        trim_heap();
        trim_heap();

        let rss = self.stats.lock().map(|mut q| q.resident_set_size()).unwrap_or_default();
        debug!(bytes = released, rss, "Released memory.");
    }
}

fn busy_loop(duty_cycle: f64, duration: Duration) -> Duration {
    let idle_fraction = (1.0 - duty_cycle).clamp(0.0, 1.0);
    let sleep_time = Duration::from_millis((DUTY_CYCLE_PERIOD_MS as f64 * idle_fraction).round() as u64);

    let start = Instant::now();
    let mut last_boundary = None;
    loop {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        if now_ms % DUTY_CYCLE_PERIOD_MS == 0 && last_boundary != Some(now_ms) {
            last_boundary = Some(now_ms);
            thread::sleep(sleep_time);
        }

        let elapsed = start.elapsed();
        if !duration.is_zero() && elapsed >= duration {
            return elapsed;
        }

        std::hint::spin_loop();
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() {
    // SAFETY: `malloc_trim` has no preconditions.
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() {}
