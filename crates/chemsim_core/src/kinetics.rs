use crate::model::Model;
use crate::traits::DynamicalSystem;
use nalgebra::{DVector, DVectorViewMut};
use std::cell::RefCell;
use std::sync::Arc;

/// Deterministic kinetics of a reaction network as an ODE right-hand side.
///
/// `apply` first evaluates every reaction's rate (the propensity vector) and
/// then accumulates `rate_j * adjustment_j` over all reactions, i.e. the
/// product of the stoichiometry matrix with the rate vector.
pub struct ReactionKinetics {
    model: Arc<Model>,
    // Interior mutability for scratch buffers to avoid allocation in apply.
    // Note: this makes the system !Sync; every run owns its own instance.
    rates: RefCell<DVector<f64>>,
    stack: RefCell<Vec<f64>>,
}

impl ReactionKinetics {
    pub fn new(model: Arc<Model>) -> Self {
        let num_reactions = model.num_reactions();
        Self {
            model,
            rates: RefCell::new(DVector::zeros(num_reactions)),
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Writes the instantaneous rate of every reaction into `rates`.
    pub fn compute_reaction_rates(&self, t: f64, x: &[f64], rates: &mut [f64]) {
        let mut stack = self.stack.borrow_mut();
        for (index, rate) in rates.iter_mut().enumerate() {
            *rate = self.model.reaction_rate(index, x, t, &mut stack);
        }
    }

    /// Reaction rates from the most recent derivative evaluation.
    pub fn last_reaction_rates(&self) -> Vec<f64> {
        self.rates.borrow().iter().copied().collect()
    }
}

impl DynamicalSystem for ReactionKinetics {
    fn dimension(&self) -> usize {
        self.model.num_dynamic_symbols()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let mut rates = self.rates.borrow_mut();
        self.compute_reaction_rates(t, x, rates.as_mut_slice());

        out.fill(0.0);
        let len = out.len();
        let mut derivative = DVectorViewMut::from_slice(out, len);
        derivative.gemv(1.0, self.model.stoichiometry(), &*rates, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::ReactionKinetics;
    use crate::model::{ModelBuilder, ReactionDefinition};
    use crate::traits::DynamicalSystem;
    use std::sync::Arc;

    #[test]
    fn zero_reactions_give_zero_derivative() {
        let model = ModelBuilder::new("inert")
            .species("A", 3.0)
            .species("B", 7.0)
            .build()
            .unwrap();
        let kinetics = ReactionKinetics::new(Arc::new(model));
        let mut out = [1.0, 1.0];
        for t in [0.0, 1.0, 1e6] {
            kinetics.apply(t, &[3.0, 7.0], &mut out);
            assert_eq!(out, [0.0, 0.0]);
        }
    }

    #[test]
    fn accumulates_scaled_adjustment_vectors() {
        // A + B -> C (k = 2), C -> A (k = 0.5)
        let model = ModelBuilder::new("reversible")
            .species("A", 1.0)
            .species("B", 2.0)
            .species("C", 0.0)
            .reaction(
                ReactionDefinition::mass_action("forward", 2.0)
                    .reactant("A", 1)
                    .reactant("B", 1)
                    .product("C", 1),
            )
            .reaction(
                ReactionDefinition::mass_action("back", 0.5)
                    .reactant("C", 1)
                    .product("A", 1),
            )
            .build()
            .unwrap();
        let kinetics = ReactionKinetics::new(Arc::new(model));
        let state = [1.0, 3.0, 4.0];
        let mut out = [0.0; 3];
        kinetics.apply(0.0, &state, &mut out);

        let forward = 2.0 * 1.0 * 3.0;
        let back = 0.5 * 4.0;
        assert_eq!(kinetics.last_reaction_rates(), vec![forward, back]);
        let expected = [-forward + back, -forward, forward - back];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
        }
    }

    #[test]
    fn rate_laws_see_the_time_argument() {
        let model = ModelBuilder::new("pulse")
            .species("A", 0.0)
            .reaction(ReactionDefinition::with_expression("source", "2 * time").product("A", 1))
            .build()
            .unwrap();
        let kinetics = ReactionKinetics::new(Arc::new(model));
        let mut out = [0.0];
        kinetics.apply(3.0, &[0.0], &mut out);
        assert_eq!(out, [6.0]);
    }
}
