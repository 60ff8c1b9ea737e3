/// Right-hand side of an ODE system `dy/dt = f(t, y)`.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: time at which to evaluate (trial times are passed explicitly)
    /// x: state
    /// out: buffer to write dx/dt into
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]);
}
