use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use bytesize::ByteSize;
use clap::Parser;
use synthmesh_core::{
    error::{ErrorContext as _, GenericError},
    generic_error,
    load::{LoadParameters, LoadSpec},
    DispatchMode, NodeConfig, RouteTable,
};

/// Name that marks a node as the root of the mesh even without `--root`.
const ROOT_NODE_NAME: &str = "svc-0-mock";

/// One node of a synthetic service mesh.
#[derive(Clone, Debug, Parser)]
#[command(about)]
pub struct Cli {
    /// Name of this node.
    ///
    /// This is both the service name spans are recorded under and the node's identity in the route table.
    #[arg(long)]
    pub name: String,

    /// Port to listen on.
    ///
    /// Downstream targets given as a bare host are assumed to listen on the same port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Mean size of the synthetic payload generated per request, in bytes.
    #[arg(long, alias = "msg-size", default_value_t = 256)]
    pub payload_size: u64,

    /// Time spent applying CPU load per request, in milliseconds.
    #[arg(long, alias = "msg-time", default_value_t = 10)]
    pub process_time: u64,

    /// Fixed CPU duty cycle per request, between 0 and 1.
    ///
    /// When set, the parametric load model (`-x`, `-y`, `-a` through `-H`) is ignored. Without it, the model decides
    /// the memory held per request: all-zero parameters resolve to 195 memory units, or about 6 GiB per request at the
    /// default `--memory-unit-size`.
    #[arg(long)]
    pub cpu_load: Option<f64>,

    /// Fixed number of memory units held per request.
    ///
    /// Only used together with `--cpu-load`.
    #[arg(long, default_value_t = 0, requires = "cpu_load")]
    pub memory: u32,

    /// Load model selector for the CPU landscape.
    #[arg(short = 'x', default_value_t = 0, allow_negative_numbers = true)]
    pub x: i64,

    /// Load model selector for the memory landscape.
    #[arg(short = 'y', default_value_t = 0, allow_negative_numbers = true)]
    pub y: i64,

    /// Load model parameter A.
    #[arg(short = 'a', default_value_t = 0.0, allow_negative_numbers = true)]
    pub a: f64,

    /// Load model parameter B.
    #[arg(short = 'b', default_value_t = 0.0, allow_negative_numbers = true)]
    pub b: f64,

    /// Load model parameter C.
    #[arg(short = 'c', default_value_t = 0.0, allow_negative_numbers = true)]
    pub c: f64,

    /// Load model parameter D.
    #[arg(short = 'd', default_value_t = 0.0, allow_negative_numbers = true)]
    pub d: f64,

    /// Load model parameter E.
    #[arg(short = 'e', default_value_t = 0.0, allow_negative_numbers = true)]
    pub e: f64,

    /// Load model parameter F.
    #[arg(short = 'f', default_value_t = 0.0, allow_negative_numbers = true)]
    pub f: f64,

    /// Load model parameter G.
    #[arg(short = 'g', default_value_t = 0.0, allow_negative_numbers = true)]
    pub g: f64,

    /// Load model parameter H.
    #[arg(short = 'H', default_value_t = 0.0, allow_negative_numbers = true)]
    pub h: f64,

    /// Size of a single memory unit.
    ///
    /// Supports human-friendly values such as `32MiB` or `1.5GB`. The parametric load model holds up to 1024 units per
    /// in-flight request, so lower this (or use `--cpu-load`) on hosts without tens of GiB of memory to spare.
    #[arg(long, default_value = "32MiB")]
    pub memory_unit_size: ByteSize,

    /// Dispatch mode for route-keyed requests.
    ///
    /// One of `round-robin`, `random`, `broadcast`, or `route-table`.
    #[arg(long, default_value = "route-table")]
    pub dispatch_mode: DispatchMode,

    /// Path to the YAML route table.
    ///
    /// Without one, every route-keyed request terminates at this node.
    #[arg(long)]
    pub routes: Option<PathBuf>,

    /// Seed for the node's random source.
    #[arg(long, default_value_t = 42)]
    pub random_seed: u64,

    /// Start new traces here instead of continuing upstream ones.
    #[arg(long)]
    pub root: bool,

    /// Address (`host:port`) of a Zipkin-compatible tracing backend.
    ///
    /// Without one, finished spans are written to the log.
    #[arg(long)]
    pub zipkin: Option<String>,

    /// Whether traces started at this node are sampled.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub sampling: bool,

    /// Directory to write the PID file to.
    #[arg(long, default_value = "/tmp")]
    pub pid_path: PathBuf,

    /// Admission queue capacity.
    ///
    /// Defaults to the sustainable request rate implied by the CPU load and processing time.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// How long a request may wait for admission, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub admission_timeout: u64,

    /// How long a single downstream call may take, in milliseconds.
    #[arg(long, default_value_t = 10000)]
    pub downstream_timeout: u64,

    /// Number of busy loops to run while applying CPU load.
    ///
    /// Defaults to the number of available cores.
    #[arg(long)]
    pub cores: Option<NonZeroUsize>,

    /// Downstream target addresses.
    ///
    /// Each is either a bare host, a `host:port` pair, or a full `http://` base URL. TLS targets are not supported.
    pub targets: Vec<String>,
}

impl Cli {
    /// Returns `true` if this node starts traces.
    pub fn is_root(&self) -> bool {
        self.root || self.name == ROOT_NODE_NAME
    }

    /// Returns the per-request load specification.
    pub fn load(&self) -> LoadSpec {
        match self.cpu_load {
            Some(cpu_duty_cycle) => LoadSpec::Fixed {
                cpu_duty_cycle,
                memory_units: self.memory,
            },
            None => LoadSpec::Modeled(LoadParameters {
                x: self.x,
                y: self.y,
                a: self.a,
                b: self.b,
                c: self.c,
                d: self.d,
                e: self.e,
                f: self.f,
                g: self.g,
                h: self.h,
            }),
        }
    }

    /// Builds the node configuration.
    ///
    /// # Errors
    ///
    /// If any setting is invalid, an error is returned.
    pub fn node_config(&self) -> Result<NodeConfig, GenericError> {
        if let Some(target) = self.targets.iter().find(|target| target.starts_with("https://")) {
            return Err(generic_error!(
                "Downstream target '{}' uses TLS, which is not supported. Use an `http://` address instead.",
                target
            ));
        }

        let mut builder = NodeConfig::builder(self.name.clone())
            .with_port(self.port)
            .with_payload_size(self.payload_size)
            .with_load(self.load())
            .with_memory_unit_size(self.memory_unit_size)
            .with_process_time(Duration::from_millis(self.process_time))
            .with_targets(self.targets.iter().cloned())
            .with_dispatch_mode(self.dispatch_mode)
            .with_random_seed(self.random_seed)
            .with_root(self.is_root())
            .with_admission_timeout(Duration::from_millis(self.admission_timeout))
            .with_downstream_timeout(Duration::from_millis(self.downstream_timeout));

        if let Some(capacity) = self.queue_capacity {
            builder = builder.with_queue_capacity(capacity);
        }
        if let Some(cores) = self.cores {
            builder = builder.with_parallelism(cores);
        }

        builder.build().error_context("Invalid node configuration.")
    }

    /// Loads the route table, or returns an empty one if no route table was given.
    ///
    /// # Errors
    ///
    /// If the route table file cannot be read or parsed, an error is returned.
    pub fn route_table(&self) -> Result<RouteTable, GenericError> {
        match &self.routes {
            Some(path) => RouteTable::try_from_file(path).error_context("Failed to load route table."),
            None => Ok(RouteTable::new()),
        }
    }
}
