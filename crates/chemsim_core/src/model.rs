//! Reaction-network model: species, constants, derived expressions and
//! reactions, validated and compiled into a form the integrator can consume.
//!
//! A [`Model`] is immutable once built. It fixes the dynamic-symbol ordering
//! (non-boundary species in definition order) that every state vector and
//! scratch buffer of a simulation run shares.

use crate::equation_engine::{parse, Bytecode, Compiler, Expr, OpCode, VM, TIME_SYMBOL};
use crate::error::{Result, SimulationError};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentDefinition {
    pub name: String,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesDefinition {
    pub name: String,
    #[serde(default)]
    pub compartment: Option<String>,
    pub initial_value: f64,
    /// Boundary species are held fixed and never integrated.
    #[serde(default)]
    pub boundary: bool,
}

/// A named expression that can be requested as an observable or referenced
/// from rate laws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionDefinition {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateDefinition {
    /// `k * [X1]^n1 * [X2]^n2 ...` over the reactants.
    MassAction { rate_constant: f64 },
    /// Arbitrary rate expression over species, constants, expressions and `time`.
    Expression { expression: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub species: String,
    #[serde(default = "default_stoichiometry")]
    pub stoichiometry: u32,
}

fn default_stoichiometry() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionDefinition {
    pub name: String,
    #[serde(default)]
    pub reactants: Vec<Participant>,
    #[serde(default)]
    pub products: Vec<Participant>,
    pub rate: RateDefinition,
}

impl ReactionDefinition {
    pub fn new(name: &str, rate: RateDefinition) -> Self {
        Self {
            name: name.to_string(),
            reactants: Vec::new(),
            products: Vec::new(),
            rate,
        }
    }

    pub fn mass_action(name: &str, rate_constant: f64) -> Self {
        Self::new(name, RateDefinition::MassAction { rate_constant })
    }

    pub fn with_expression(name: &str, expression: &str) -> Self {
        Self::new(
            name,
            RateDefinition::Expression {
                expression: expression.to_string(),
            },
        )
    }

    pub fn reactant(mut self, species: &str, stoichiometry: u32) -> Self {
        self.reactants.push(Participant {
            species: species.to_string(),
            stoichiometry,
        });
        self
    }

    pub fn product(mut self, species: &str, stoichiometry: u32) -> Self {
        self.products.push(Participant {
            species: species.to_string(),
            stoichiometry,
        });
        self
    }
}

/// Plain-data description of a model, as produced by a model-definition front
/// end or deserialized from a host application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub compartments: Vec<CompartmentDefinition>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub species: Vec<SpeciesDefinition>,
    #[serde(default)]
    pub expressions: Vec<ExpressionDefinition>,
    #[serde(default)]
    pub reactions: Vec<ReactionDefinition>,
}

impl ModelDefinition {
    pub fn build(&self) -> Result<Model> {
        Model::from_definition(self)
    }
}

/// Fluent construction of a [`ModelDefinition`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    definition: ModelDefinition,
}

impl ModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            definition: ModelDefinition {
                name: name.to_string(),
                ..ModelDefinition::default()
            },
        }
    }

    pub fn compartment(mut self, name: &str, volume: f64) -> Self {
        self.definition.compartments.push(CompartmentDefinition {
            name: name.to_string(),
            volume,
        });
        self
    }

    pub fn parameter(mut self, name: &str, value: f64) -> Self {
        self.definition.parameters.push(ParameterDefinition {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn species(self, name: &str, initial_value: f64) -> Self {
        self.push_species(name, None, initial_value, false)
    }

    pub fn species_in(self, name: &str, compartment: &str, initial_value: f64) -> Self {
        self.push_species(name, Some(compartment), initial_value, false)
    }

    pub fn boundary_species(self, name: &str, initial_value: f64) -> Self {
        self.push_species(name, None, initial_value, true)
    }

    fn push_species(
        mut self,
        name: &str,
        compartment: Option<&str>,
        initial_value: f64,
        boundary: bool,
    ) -> Self {
        self.definition.species.push(SpeciesDefinition {
            name: name.to_string(),
            compartment: compartment.map(str::to_string),
            initial_value,
            boundary,
        });
        self
    }

    pub fn expression(mut self, name: &str, expression: &str) -> Self {
        self.definition.expressions.push(ExpressionDefinition {
            name: name.to_string(),
            expression: expression.to_string(),
        });
        self
    }

    pub fn reaction(mut self, reaction: ReactionDefinition) -> Self {
        self.definition.reactions.push(reaction);
        self
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn build(self) -> Result<Model> {
        Model::from_definition(&self.definition)
    }
}

/// A resolved reference to a named quantity of a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    Time,
    /// Index into the dynamic-symbol vector.
    Dynamic(usize),
    /// Index into the constant table.
    Constant(usize),
    /// Index into the derived-expression table.
    Derived(usize),
}

/// A reaction with its compiled rate law and dense stoichiometric adjustment
/// vector over the dynamic symbols.
#[derive(Debug, Clone)]
pub struct Reaction {
    name: String,
    rate_law: Bytecode,
    adjustment_vector: Vec<f64>,
}

impl Reaction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Net change of every dynamic symbol per unit reaction event.
    pub fn adjustment_vector(&self) -> &[f64] {
        &self.adjustment_vector
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    dynamic_symbols: Vec<String>,
    initial_values: Vec<f64>,
    constant_names: Vec<String>,
    constant_values: Vec<f64>,
    expressions: Vec<(String, Bytecode)>,
    reactions: Vec<Reaction>,
    stoichiometry: DMatrix<f64>,
    symbols: HashMap<String, Symbol>,
}

impl Model {
    pub fn from_definition(definition: &ModelDefinition) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut claim = |name: &str, kind: &str| -> Result<()> {
            if name.is_empty() {
                return Err(SimulationError::InvalidModel(format!(
                    "{kind} name must not be empty"
                )));
            }
            if name == TIME_SYMBOL {
                return Err(SimulationError::InvalidModel(format!(
                    "\"{TIME_SYMBOL}\" is reserved and cannot name a {kind}"
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(SimulationError::InvalidModel(format!(
                    "duplicate symbol name \"{name}\""
                )));
            }
            Ok(())
        };

        let mut constant_names = Vec::new();
        let mut constant_values = Vec::new();
        let mut compartments = HashSet::new();

        for compartment in &definition.compartments {
            claim(&compartment.name, "compartment")?;
            if !compartment.volume.is_finite() || compartment.volume <= 0.0 {
                return Err(SimulationError::InvalidModel(format!(
                    "compartment \"{}\" must have a positive finite volume",
                    compartment.name
                )));
            }
            compartments.insert(compartment.name.as_str());
            constant_names.push(compartment.name.clone());
            constant_values.push(compartment.volume);
        }

        for parameter in &definition.parameters {
            claim(&parameter.name, "parameter")?;
            if !parameter.value.is_finite() {
                return Err(SimulationError::InvalidModel(format!(
                    "parameter \"{}\" must be finite",
                    parameter.name
                )));
            }
            constant_names.push(parameter.name.clone());
            constant_values.push(parameter.value);
        }

        let mut dynamic_symbols = Vec::new();
        let mut initial_values = Vec::new();
        for species in &definition.species {
            claim(&species.name, "species")?;
            if !species.initial_value.is_finite() || species.initial_value < 0.0 {
                return Err(SimulationError::InvalidModel(format!(
                    "species \"{}\" must have a finite, non-negative initial value",
                    species.name
                )));
            }
            if let Some(compartment) = &species.compartment {
                if !compartments.contains(compartment.as_str()) {
                    return Err(SimulationError::InvalidModel(format!(
                        "species \"{}\" refers to unknown compartment \"{compartment}\"",
                        species.name
                    )));
                }
            }
            if species.boundary {
                constant_names.push(species.name.clone());
                constant_values.push(species.initial_value);
            } else {
                dynamic_symbols.push(species.name.clone());
                initial_values.push(species.initial_value);
            }
        }

        let mut parsed_expressions = HashMap::new();
        for expression in &definition.expressions {
            claim(&expression.name, "expression")?;
            let parsed = parse(&expression.expression)?;
            parsed_expressions.insert(expression.name.clone(), parsed);
        }

        let compiler =
            Compiler::new(&dynamic_symbols, &constant_names).with_expressions(parsed_expressions);

        let mut expressions = Vec::with_capacity(definition.expressions.len());
        for expression in &definition.expressions {
            let parsed = &compiler.expressions[&expression.name];
            expressions.push((expression.name.clone(), compiler.compile(parsed)?));
        }

        let boundary_species: HashSet<&str> = definition
            .species
            .iter()
            .filter(|species| species.boundary)
            .map(|species| species.name.as_str())
            .collect();
        let mut reaction_names = HashSet::new();
        let mut reactions = Vec::with_capacity(definition.reactions.len());
        for reaction in &definition.reactions {
            if !reaction_names.insert(reaction.name.as_str()) {
                return Err(SimulationError::InvalidModel(format!(
                    "duplicate reaction name \"{}\"",
                    reaction.name
                )));
            }
            reactions.push(compile_reaction(
                reaction,
                &compiler,
                &boundary_species,
                dynamic_symbols.len(),
            )?);
        }

        let stoichiometry = DMatrix::from_fn(dynamic_symbols.len(), reactions.len(), |i, j| {
            reactions[j].adjustment_vector[i]
        });

        let mut symbols = HashMap::new();
        for (i, name) in dynamic_symbols.iter().enumerate() {
            symbols.insert(name.clone(), Symbol::Dynamic(i));
        }
        for (i, name) in constant_names.iter().enumerate() {
            symbols.insert(name.clone(), Symbol::Constant(i));
        }
        for (i, (name, _)) in expressions.iter().enumerate() {
            symbols.insert(name.clone(), Symbol::Derived(i));
        }

        Ok(Self {
            name: definition.name.clone(),
            dynamic_symbols,
            initial_values,
            constant_names,
            constant_values,
            expressions,
            reactions,
            stoichiometry,
            symbols,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dynamic (integrated) species, in state-vector order.
    pub fn dynamic_symbols(&self) -> &[String] {
        &self.dynamic_symbols
    }

    pub fn num_dynamic_symbols(&self) -> usize {
        self.dynamic_symbols.len()
    }

    pub fn initial_values(&self) -> &[f64] {
        &self.initial_values
    }

    pub fn constant_names(&self) -> &[String] {
        &self.constant_names
    }

    pub fn constant_values(&self) -> &[f64] {
        &self.constant_values
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn num_reactions(&self) -> usize {
        self.reactions.len()
    }

    /// Dynamic symbols × reactions; column `j` is reaction `j`'s adjustment vector.
    pub fn stoichiometry(&self) -> &DMatrix<f64> {
        &self.stoichiometry
    }

    pub fn resolve(&self, name: &str) -> Result<Symbol> {
        if name == TIME_SYMBOL {
            return Ok(Symbol::Time);
        }
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| SimulationError::SymbolNotFound(name.to_string()))
    }

    /// Value of `symbol` for the dynamic state `state` at `time`.
    pub fn evaluate(
        &self,
        symbol: Symbol,
        state: &[f64],
        time: f64,
        stack: &mut Vec<f64>,
    ) -> f64 {
        match symbol {
            Symbol::Time => time,
            Symbol::Dynamic(idx) => state[idx],
            Symbol::Constant(idx) => self.constant_values[idx],
            Symbol::Derived(idx) => {
                VM::execute(&self.expressions[idx].1, state, &self.constant_values, time, stack)
            }
        }
    }

    /// Instantaneous rate of reaction `index`.
    pub fn reaction_rate(
        &self,
        index: usize,
        state: &[f64],
        time: f64,
        stack: &mut Vec<f64>,
    ) -> f64 {
        VM::execute(
            &self.reactions[index].rate_law,
            state,
            &self.constant_values,
            time,
            stack,
        )
    }
}

fn compile_reaction(
    definition: &ReactionDefinition,
    compiler: &Compiler,
    boundary_species: &HashSet<&str>,
    num_dynamic: usize,
) -> Result<Reaction> {
    if definition.name.is_empty() {
        return Err(SimulationError::InvalidModel(
            "reaction name must not be empty".to_string(),
        ));
    }
    if definition.reactants.is_empty() && definition.products.is_empty() {
        return Err(SimulationError::InvalidModel(format!(
            "reaction \"{}\" has no reactants or products",
            definition.name
        )));
    }

    let mut adjustment_vector = vec![0.0; num_dynamic];
    let mut reactant_ops = Vec::new();

    for (participants, sign) in [(&definition.reactants, -1.0), (&definition.products, 1.0)] {
        for participant in participants {
            if participant.stoichiometry == 0 {
                return Err(SimulationError::InvalidModel(format!(
                    "reaction \"{}\": stoichiometry of \"{}\" must be positive",
                    definition.name, participant.species
                )));
            }
            let load = species_load(
                compiler,
                boundary_species,
                &definition.name,
                &participant.species,
            )?;
            if let OpCode::LoadVar(idx) = load {
                adjustment_vector[idx] += sign * f64::from(participant.stoichiometry);
            }
            if sign < 0.0 {
                reactant_ops.push((load, participant.stoichiometry));
            }
        }
    }

    let rate_law = match &definition.rate {
        RateDefinition::MassAction { rate_constant } => {
            if !rate_constant.is_finite() || *rate_constant < 0.0 {
                return Err(SimulationError::InvalidModel(format!(
                    "reaction \"{}\" needs a finite, non-negative rate constant",
                    definition.name
                )));
            }
            mass_action_bytecode(*rate_constant, &reactant_ops)
        }
        RateDefinition::Expression { expression } => {
            let parsed: Expr = parse(expression)?;
            compiler.compile(&parsed)?
        }
    };

    Ok(Reaction {
        name: definition.name.clone(),
        rate_law,
        adjustment_vector,
    })
}

// Participants must be species (dynamic or boundary), not parameters.
fn species_load(
    compiler: &Compiler,
    boundary_species: &HashSet<&str>,
    reaction: &str,
    species: &str,
) -> Result<OpCode> {
    if let Some(&idx) = compiler.var_map.get(species) {
        return Ok(OpCode::LoadVar(idx));
    }
    match compiler.param_map.get(species) {
        Some(&idx) if boundary_species.contains(species) => Ok(OpCode::LoadParam(idx)),
        _ => Err(SimulationError::InvalidModel(format!(
            "reaction \"{reaction}\" refers to unknown species \"{species}\""
        ))),
    }
}

fn mass_action_bytecode(rate_constant: f64, reactants: &[(OpCode, u32)]) -> Bytecode {
    let mut ops = vec![OpCode::LoadConst(rate_constant)];
    for &(load, stoichiometry) in reactants {
        ops.push(load);
        if stoichiometry > 1 {
            ops.push(OpCode::LoadConst(f64::from(stoichiometry)));
            ops.push(OpCode::Pow);
        }
        ops.push(OpCode::Mul);
    }
    Bytecode { ops }
}
