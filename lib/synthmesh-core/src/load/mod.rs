//! Synthetic resource load.

mod model;
pub use self::model::{
    beale_duty_cycle, himmelblau_memory_units, LoadParameters, LoadProfile, MAX_CPU_DUTY_CYCLE, MAX_MEMORY_UNITS,
    MIN_CPU_DUTY_CYCLE,
};

mod simulator;
pub use self::simulator::{MemoryBlock, ResourceSimulator, DEFAULT_MEMORY_UNIT_SIZE};

/// How a node's per-request load is specified.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadSpec {
    /// A fixed duty cycle and memory footprint.
    Fixed {
        /// Fraction of wall-clock time spent spinning, in `[0, 1]`.
        cpu_duty_cycle: f64,

        /// Number of memory units held per request.
        memory_units: u32,
    },

    /// A footprint derived from the parametric load model.
    Modeled(LoadParameters),
}

impl LoadSpec {
    /// Resolves this specification into a concrete load profile.
    pub fn profile(&self) -> LoadProfile {
        match self {
            Self::Fixed {
                cpu_duty_cycle,
                memory_units,
            } => LoadProfile {
                cpu_duty_cycle: *cpu_duty_cycle,
                memory_units: *memory_units,
            },
            Self::Modeled(parameters) => parameters.profile(),
        }
    }
}

impl Default for LoadSpec {
    fn default() -> Self {
        Self::Fixed {
            cpu_duty_cycle: 0.1,
            memory_units: 0,
        }
    }
}
