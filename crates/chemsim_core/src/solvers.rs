use crate::traits::DynamicalSystem;

/// Classic Runge-Kutta 4th order step with non-negative clamping.
///
/// The stage vectors keep the scaling used by the step-doubling controller:
/// `k1` and `k2` are pre-multiplied by `h/2`, `k3` and `k4` by `h`, so the
/// final combination is `y + k1/3 + 2*k2/3 + k3/3 + k4/6`. This is the
/// textbook RK4 update written in different stage units.
pub struct RK4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RK4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }

    pub fn dimension(&self) -> usize {
        self.k1.len()
    }

    /// Zeroes every stage buffer and resizes it to `dim`.
    pub fn reset(&mut self, dim: usize) {
        for buffer in [
            &mut self.k1,
            &mut self.k2,
            &mut self.k3,
            &mut self.k4,
            &mut self.tmp,
        ] {
            buffer.clear();
            buffer.resize(dim, 0.0);
        }
    }

    /// Advances `state` from `t` by `h` and writes the result into `out`.
    ///
    /// `state` is left untouched. Negative components of the result are
    /// clamped to zero, since concentrations cannot go negative.
    pub fn step_into(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        h: f64,
        out: &mut [f64],
    ) {
        debug_assert_eq!(system.dimension(), self.dimension());
        debug_assert_eq!(state.len(), self.dimension());
        let half = 0.5 * h;

        // k1 = h/2 * f(t, y)
        system.apply(t, state, &mut self.k1);
        for k in self.k1.iter_mut() {
            *k *= half;
        }

        // k2 = h/2 * f(t + h/2, y + k1)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + self.k1[i];
        }
        system.apply(t + half, &self.tmp, &mut self.k2);
        for k in self.k2.iter_mut() {
            *k *= half;
        }

        // k3 = h * f(t + h/2, y + k2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + self.k2[i];
        }
        system.apply(t + half, &self.tmp, &mut self.k3);
        for k in self.k3.iter_mut() {
            *k *= h;
        }

        // k4 = h * f(t + h, y + k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + self.k3[i];
        }
        system.apply(t + h, &self.tmp, &mut self.k4);
        for k in self.k4.iter_mut() {
            *k *= h;
        }

        for i in 0..state.len() {
            let next = state[i]
                + self.k1[i] / 3.0
                + 2.0 * self.k2[i] / 3.0
                + self.k3[i] / 3.0
                + self.k4[i] / 6.0;
            out[i] = if next < 0.0 { 0.0 } else { next };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RK4;
    use crate::traits::DynamicalSystem;
    use std::cell::RefCell;

    struct LinearSystem {
        rate: f64,
    }

    impl DynamicalSystem for LinearSystem {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = self.rate * x[0];
        }
    }

    /// dx/dt = -rate for every component.
    struct ConstantDrain {
        rate: f64,
    }

    impl DynamicalSystem for ConstantDrain {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, _x: &[f64], out: &mut [f64]) {
            out.fill(-self.rate);
        }
    }

    /// dx/dt = t, records every evaluation time.
    struct TimeRecorder {
        seen: RefCell<Vec<f64>>,
    }

    impl DynamicalSystem for TimeRecorder {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, t: f64, _x: &[f64], out: &mut [f64]) {
            self.seen.borrow_mut().push(t);
            out[0] = t;
        }
    }

    #[test]
    fn matches_exponential_decay() {
        let system = LinearSystem { rate: -1.0 };
        let mut rk4 = RK4::new(1);
        let mut out = [0.0];
        rk4.step_into(&system, 0.0, &[1.0], 0.1, &mut out);
        assert!((out[0] - (-0.1f64).exp()).abs() < 1e-7);
    }

    #[test]
    fn equals_textbook_rk4_combination() {
        let system = LinearSystem { rate: 0.7 };
        let (y, h) = (2.0, 0.3);
        let f = |x: f64| 0.7 * x;
        let k1 = f(y);
        let k2 = f(y + 0.5 * h * k1);
        let k3 = f(y + 0.5 * h * k2);
        let k4 = f(y + h * k3);
        let textbook = y + h / 6.0 * (k1 + 2.0 * k2 + 2.0 * k3 + k4);

        let mut rk4 = RK4::new(1);
        let mut out = [0.0];
        rk4.step_into(&system, 0.0, &[y], h, &mut out);
        assert!((out[0] - textbook).abs() < 1e-12);
    }

    #[test]
    fn evaluates_at_half_and_full_step_times() {
        let system = TimeRecorder {
            seen: RefCell::new(Vec::new()),
        };
        let mut rk4 = RK4::new(1);
        let mut out = [0.0];
        rk4.step_into(&system, 2.0, &[0.0], 1.0, &mut out);
        assert_eq!(*system.seen.borrow(), vec![2.0, 2.5, 2.5, 3.0]);
        // Integral of t from 2 to 3 is exact for RK4.
        assert!((out[0] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn clamps_negative_results_to_zero() {
        let system = ConstantDrain { rate: 10.0 };
        let mut rk4 = RK4::new(2);
        let mut out = [0.0; 2];
        rk4.step_into(&system, 0.0, &[1.0, 50.0], 1.0, &mut out);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 40.0).abs() < 1e-12);
    }
}
