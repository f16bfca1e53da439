//! Node configuration.
use std::{num::NonZeroUsize, time::Duration};

use bytesize::ByteSize;
use snafu::Snafu;

use crate::{
    dispatch::DispatchMode,
    load::{LoadSpec, DEFAULT_MEMORY_UNIT_SIZE},
};

/// Admission queue capacity used when the node's throughput ceiling is unbounded.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Largest admission queue capacity a node accepts.
///
/// Queue slots are allocated up front, and derived capacities are clamped to this value.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigError {
    /// The node name is empty.
    #[snafu(display("node name must not be empty"))]
    EmptyName,

    /// The flat CPU load is not a fraction.
    #[snafu(display("CPU load must be between 0 and 1 (got {})", value))]
    CpuLoadOutOfRange {
        /// The configured load.
        value: f64,
    },

    /// The admission queue capacity override is zero.
    #[snafu(display("admission queue capacity must be at least 1"))]
    ZeroQueueCapacity,

    /// The admission queue capacity override is too large.
    #[snafu(display("admission queue capacity must be at most {} (got {})", max, value))]
    QueueCapacityTooLarge {
        /// The configured capacity.
        value: usize,

        /// The largest accepted capacity.
        max: usize,
    },

    /// A timeout is zero.
    #[snafu(display("{} timeout must be greater than zero", which))]
    ZeroTimeout {
        /// Which timeout.
        which: &'static str,
    },
}

/// Immutable configuration of a single mesh node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    name: String,
    port: u16,
    payload_size: u64,
    load: LoadSpec,
    memory_unit_size: ByteSize,
    process_time: Duration,
    targets: Vec<String>,
    dispatch_mode: DispatchMode,
    random_seed: u64,
    is_root: bool,
    queue_capacity: Option<usize>,
    admission_timeout: Duration,
    downstream_timeout: Duration,
    parallelism: NonZeroUsize,
}

impl NodeConfig {
    /// Starts building the configuration of the node with the given name.
    pub fn builder(name: impl Into<String>) -> NodeConfigBuilder {
        NodeConfigBuilder::new(name.into())
    }

    /// Returns the node name, which is also its identity in the route table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the mean size of locally generated payloads, in bytes.
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Returns the per-request load specification.
    pub fn load(&self) -> &LoadSpec {
        &self.load
    }

    /// Returns the size of a single memory unit.
    pub fn memory_unit_size(&self) -> ByteSize {
        self.memory_unit_size
    }

    /// Returns the per-request processing time.
    pub fn process_time(&self) -> Duration {
        self.process_time
    }

    /// Returns the downstream target addresses.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Returns the dispatch mode used for route-keyed requests.
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    /// Returns the seed of the node's random source.
    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// Returns `true` if this node starts traces rather than continuing them.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Returns how long a request may wait for admission.
    pub fn admission_timeout(&self) -> Duration {
        self.admission_timeout
    }

    /// Returns how long a single downstream call may take.
    pub fn downstream_timeout(&self) -> Duration {
        self.downstream_timeout
    }

    /// Returns the number of busy loops run while applying CPU load.
    pub fn parallelism(&self) -> NonZeroUsize {
        self.parallelism
    }

    /// Returns the sustainable request rate implied by the load and processing time.
    ///
    /// Returns `None` when the processing time is zero, as the rate is then unbounded.
    pub fn requests_per_second(&self) -> Option<f64> {
        let process_secs = self.process_time.as_secs_f64();
        if process_secs == 0.0 {
            return None;
        }

        Some(100.0 * self.load.profile().cpu_duty_cycle / process_secs)
    }

    /// Returns the admission queue capacity.
    ///
    /// An explicit override wins. Otherwise the capacity is the sustainable request rate, rounded up, and between one
    /// and [`MAX_QUEUE_CAPACITY`].
    pub fn admission_capacity(&self) -> usize {
        if let Some(capacity) = self.queue_capacity {
            return capacity;
        }

        match self.requests_per_second() {
            Some(rps) if rps.is_finite() => (rps.ceil() as usize).clamp(1, MAX_QUEUE_CAPACITY),
            _ => DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Builder for [`NodeConfig`].
#[derive(Clone, Debug)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    fn new(name: String) -> Self {
        Self {
            config: NodeConfig {
                name,
                port: 8080,
                payload_size: 256,
                load: LoadSpec::default(),
                memory_unit_size: DEFAULT_MEMORY_UNIT_SIZE,
                process_time: Duration::from_millis(10),
                targets: Vec::new(),
                dispatch_mode: DispatchMode::default(),
                random_seed: 42,
                is_root: false,
                queue_capacity: None,
                admission_timeout: Duration::from_secs(5),
                downstream_timeout: Duration::from_secs(10),
                parallelism: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            },
        }
    }

    /// Sets the listening port.
    ///
    /// Defaults to 8080.
    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the mean payload size, in bytes.
    ///
    /// Defaults to 256.
    pub fn with_payload_size(mut self, payload_size: u64) -> Self {
        self.config.payload_size = payload_size;
        self
    }

    /// Sets the per-request load.
    pub fn with_load(mut self, load: LoadSpec) -> Self {
        self.config.load = load;
        self
    }

    /// Sets the size of a single memory unit.
    ///
    /// Defaults to 32 MiB.
    pub fn with_memory_unit_size(mut self, memory_unit_size: ByteSize) -> Self {
        self.config.memory_unit_size = memory_unit_size;
        self
    }

    /// Sets the per-request processing time.
    ///
    /// Defaults to 10 milliseconds. A processing time of zero skips CPU load entirely.
    pub fn with_process_time(mut self, process_time: Duration) -> Self {
        self.config.process_time = process_time;
        self
    }

    /// Sets the downstream target addresses.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the dispatch mode for route-keyed requests.
    pub fn with_dispatch_mode(mut self, dispatch_mode: DispatchMode) -> Self {
        self.config.dispatch_mode = dispatch_mode;
        self
    }

    /// Sets the random seed.
    pub fn with_random_seed(mut self, random_seed: u64) -> Self {
        self.config.random_seed = random_seed;
        self
    }

    /// Marks this node as the root of the mesh.
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.config.is_root = is_root;
        self
    }

    /// Overrides the admission queue capacity derived from the load.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.config.queue_capacity = Some(queue_capacity);
        self
    }

    /// Sets how long a request may wait for admission.
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.config.admission_timeout = timeout;
        self
    }

    /// Sets how long a single downstream call may take.
    pub fn with_downstream_timeout(mut self, timeout: Duration) -> Self {
        self.config.downstream_timeout = timeout;
        self
    }

    /// Sets the number of busy loops run while applying CPU load.
    ///
    /// Defaults to the available parallelism of the host.
    pub fn with_parallelism(mut self, parallelism: NonZeroUsize) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// If any setting is invalid, an error is returned.
    pub fn build(self) -> Result<NodeConfig, ConfigError> {
        let config = self.config;

        if config.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        if let LoadSpec::Fixed { cpu_duty_cycle, .. } = config.load {
            if !(0.0..=1.0).contains(&cpu_duty_cycle) {
                return Err(ConfigError::CpuLoadOutOfRange { value: cpu_duty_cycle });
            }
        }

        match config.queue_capacity {
            Some(0) => return Err(ConfigError::ZeroQueueCapacity),
            Some(value) if value > MAX_QUEUE_CAPACITY => {
                return Err(ConfigError::QueueCapacityTooLarge {
                    value,
                    max: MAX_QUEUE_CAPACITY,
                })
            }
            _ => {}
        }

        if config.admission_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout { which: "admission" });
        }
        if config.downstream_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout { which: "downstream" });
        }

        Ok(config)
    }
}
