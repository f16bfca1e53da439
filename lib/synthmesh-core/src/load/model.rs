//! Parametric load model.
//!
//! A node's per-request cost can be described either directly (a duty cycle and a number of memory units) or through a
//! small set of numeric parameters that are pushed through a fixed pipeline of smooth, nonlinear functions. The latter
//! makes it easy to generate many distinct, yet perfectly reproducible, load profiles across a mesh by varying a
//! handful of integers and floats per node.
//!
//! The pipeline is:
//!
//! 1. `x` picks one of two transfer functions (by parity) that maps some of `a..h` to a CPU landscape point.
//! 2. `y` does the same for a memory landscape point.
//! 3. The CPU point is evaluated on the Beale function over `[-4.5, 4.5]²`, normalized, and scaled into a duty cycle in
//!    `[0.2, 0.4]`.
//! 4. The memory point is evaluated on the Himmelblau function over `[-5, 5]²`, normalized, and scaled into a number
//!    of memory units in `[0, 1024]`.
//!
//! Points that land outside of a landscape's domain saturate to the worst case (a duty cycle of 0.4, or 1024 memory
//! units) instead of producing unbounded values.

/// Lower bound of the duty cycle produced by the CPU landscape.
pub const MIN_CPU_DUTY_CYCLE: f64 = 0.2;

/// Upper bound of the duty cycle produced by the CPU landscape, and its saturation value.
pub const MAX_CPU_DUTY_CYCLE: f64 = 0.4;

/// Upper bound of the memory units produced by the memory landscape, and its saturation value.
pub const MAX_MEMORY_UNITS: u32 = 1024;

const BEALE_DOMAIN: f64 = 4.5;
const HIMMELBLAU_DOMAIN: f64 = 5.0;

// Beale peaks at the (-4.5, -4.5) corner of its domain.
const BEALE_DOMAIN_MAX: f64 = 181_853.613_281_25;

// Himmelblau peaks at the (5, 5) corner of its domain.
const HIMMELBLAU_DOMAIN_MAX: f64 = 890.0;

/// Value substituted for a transfer output whose logarithmic denominator collapses to zero.
const DEGENERATE_POINT: f64 = 5.0;

/// Per-request resource cost.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadProfile {
    /// Fraction of wall-clock time the CPU busy-loop spends spinning.
    pub cpu_duty_cycle: f64,

    /// Number of memory units held while the request is processed.
    pub memory_units: u32,
}

/// Load model parameters.
///
/// `x` and `y` select transfer functions by parity, while `a` through `h` feed them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadParameters {
    pub x: i64,
    pub y: i64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
    pub g: f64,
    pub h: f64,
}

impl LoadParameters {
    /// Evaluates the load model for these parameters.
    pub fn profile(&self) -> LoadProfile {
        let (cpu_x, cpu_y) = self.cpu_point();
        let (mem_x, mem_y) = self.memory_point();

        LoadProfile {
            cpu_duty_cycle: beale_duty_cycle(cpu_x, cpu_y),
            memory_units: himmelblau_memory_units(mem_x, mem_y),
        }
    }

    fn cpu_point(&self) -> (f64, f64) {
        if self.x % 2 == 0 {
            logarithmic_transfer(self.a, self.b, self.c, self.d)
        } else {
            trigonometric_transfer(self.d, self.e, self.h)
        }
    }

    fn memory_point(&self) -> (f64, f64) {
        if self.y % 2 == 0 {
            rational_transfer(self.a, self.c, self.e, self.f, self.g)
        } else {
            radical_transfer(self.b, self.e, self.f)
        }
    }
}

fn logarithmic_transfer(a: f64, b: f64, c: f64, d: f64) -> (f64, f64) {
    // ln(1 + |c|) is zero exactly when c is zero.
    let denominator = c.abs().ln_1p();
    let x = if denominator == 0.0 {
        DEGENERATE_POINT
    } else {
        (a - b) / denominator
    };
    let y = BEALE_DOMAIN * (c * d).tanh();

    (x, y)
}

fn trigonometric_transfer(d: f64, e: f64, h: f64) -> (f64, f64) {
    let x = BEALE_DOMAIN * (d - e).sin();
    let y = 2.0 * (d * e + h).atan();

    (x, y)
}

fn rational_transfer(a: f64, c: f64, e: f64, f: f64, g: f64) -> (f64, f64) {
    let x = 3.0 * (a * c - e).atan();
    let y = HIMMELBLAU_DOMAIN * (f - g) / (1.0 + (f * g).abs());

    (x, y)
}

fn radical_transfer(b: f64, e: f64, f: f64) -> (f64, f64) {
    let mut radicand = b * e - f;
    if radicand < 0.0 {
        radicand = -radicand;
    }

    let x = radicand.sqrt() - 2.5;
    let y = HIMMELBLAU_DOMAIN * (b - e).sin() * f.cos();

    (x, y)
}

/// Maps a point on the Beale landscape to a CPU duty cycle in `[0.2, 0.4]`.
///
/// Points outside of `[-4.5, 4.5]²` (or non-finite points) saturate to 0.4.
pub fn beale_duty_cycle(x: f64, y: f64) -> f64 {
    if !in_domain(x, y, BEALE_DOMAIN) {
        return MAX_CPU_DUTY_CYCLE;
    }

    let value = (1.5 - x + x * y).powi(2) + (2.25 - x + x * y.powi(2)).powi(2) + (2.625 - x + x * y.powi(3)).powi(2);
    let normalized = (value / BEALE_DOMAIN_MAX).clamp(0.0, 1.0);

    MIN_CPU_DUTY_CYCLE + (MAX_CPU_DUTY_CYCLE - MIN_CPU_DUTY_CYCLE) * normalized
}

/// Maps a point on the Himmelblau landscape to a number of memory units in `[0, 1024]`.
///
/// Points outside of `[-5, 5]²` (or non-finite points) saturate to 1024.
pub fn himmelblau_memory_units(x: f64, y: f64) -> u32 {
    if !in_domain(x, y, HIMMELBLAU_DOMAIN) {
        return MAX_MEMORY_UNITS;
    }

    let value = (x.powi(2) + y - 11.0).powi(2) + (x + y.powi(2) - 7.0).powi(2);
    let normalized = (value / HIMMELBLAU_DOMAIN_MAX).clamp(0.0, 1.0);

    (f64::from(MAX_MEMORY_UNITS) * normalized) as u32
}

fn in_domain(x: f64, y: f64, bound: f64) -> bool {
    (-bound..=bound).contains(&x) && (-bound..=bound).contains(&y)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn params(x: i64, y: i64, values: [f64; 8]) -> LoadParameters {
        let [a, b, c, d, e, f, g, h] = values;
        LoadParameters {
            x,
            y,
            a,
            b,
            c,
            d,
            e,
            f,
            g,
            h,
        }
    }

    #[test]
    fn beale_saturates_outside_domain() {
        assert_eq!(beale_duty_cycle(4.6, 0.0), MAX_CPU_DUTY_CYCLE);
        assert_eq!(beale_duty_cycle(0.0, -4.51), MAX_CPU_DUTY_CYCLE);
        assert_eq!(beale_duty_cycle(f64::NAN, 0.0), MAX_CPU_DUTY_CYCLE);
        assert_eq!(beale_duty_cycle(f64::INFINITY, 1.0), MAX_CPU_DUTY_CYCLE);
    }

    #[test]
    fn himmelblau_saturates_outside_domain() {
        assert_eq!(himmelblau_memory_units(5.01, 0.0), MAX_MEMORY_UNITS);
        assert_eq!(himmelblau_memory_units(0.0, -7.0), MAX_MEMORY_UNITS);
        assert_eq!(himmelblau_memory_units(f64::NAN, f64::NAN), MAX_MEMORY_UNITS);
    }

    #[test]
    fn landscape_extremes() {
        // Beale's global minimum is at (3, 0.5).
        assert!((beale_duty_cycle(3.0, 0.5) - MIN_CPU_DUTY_CYCLE).abs() < 1e-12);
        assert!((beale_duty_cycle(-4.5, -4.5) - MAX_CPU_DUTY_CYCLE).abs() < 1e-12);

        // Himmelblau has a minimum of zero at (3, 2) and peaks at (5, 5).
        assert_eq!(himmelblau_memory_units(3.0, 2.0), 0);
        assert_eq!(himmelblau_memory_units(5.0, 5.0), MAX_MEMORY_UNITS);
    }

    #[test]
    fn degenerate_logarithm_saturates_cpu() {
        // With `x` even and `c` zero, the logarithmic transfer pins the CPU point to the edge value, which lies
        // outside of the Beale domain.
        let profile = params(0, 0, [1.0, 2.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]).profile();
        assert_eq!(profile.cpu_duty_cycle, MAX_CPU_DUTY_CYCLE);
    }

    #[test]
    fn negative_radicand_is_flipped() {
        // b * e - f = -9, which is flipped to 9 before taking the root: x' = 3 - 2.5.
        let (x, _) = radical_transfer(0.0, 1.0, 9.0);
        assert!((x - 0.5).abs() < 1e-12);
    }

    #[test]
    fn parity_selects_transfer_functions() {
        let values = [0.5, -0.25, 1.5, 0.75, -1.0, 2.0, 0.5, 1.25];
        let even = params(2, 2, values).profile();
        let odd = params(3, 3, values).profile();
        assert_ne!(even, odd);

        // Negative odd values are still odd.
        assert_eq!(params(-1, -1, values).profile(), odd);
    }

    fn arb_parameters() -> impl Strategy<Value = LoadParameters> {
        (any::<i64>(), any::<i64>(), prop::array::uniform8(-10.0f64..10.0)).prop_map(|(x, y, values)| params(x, y, values))
    }

    proptest! {
        #[test]
        fn property_test_profile_within_bounds(parameters in arb_parameters()) {
            let profile = parameters.profile();
            prop_assert!(profile.cpu_duty_cycle >= MIN_CPU_DUTY_CYCLE);
            prop_assert!(profile.cpu_duty_cycle <= MAX_CPU_DUTY_CYCLE);
            prop_assert!(profile.memory_units <= MAX_MEMORY_UNITS);
        }

        #[test]
        fn property_test_profile_is_deterministic(parameters in arb_parameters()) {
            prop_assert_eq!(parameters.profile(), parameters.profile());
        }

        #[test]
        fn property_test_out_of_domain_saturates(x in 4.5001f64..1e6, y in -4.5f64..4.5, flip in any::<bool>()) {
            let x = if flip { -x } else { x };
            prop_assert_eq!(beale_duty_cycle(x, y), MAX_CPU_DUTY_CYCLE);
            prop_assert_eq!(beale_duty_cycle(y, x), MAX_CPU_DUTY_CYCLE);

            let x = x.signum() * (x.abs() + 0.5);
            prop_assert_eq!(himmelblau_memory_units(x, y), MAX_MEMORY_UNITS);
        }
    }
}
