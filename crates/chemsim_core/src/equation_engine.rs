use crate::error::{Result, SimulationError};
use std::collections::{HashMap, HashSet};

/// Name of the reserved symbol that evaluates to the simulation time.
pub const TIME_SYMBOL: &str = "time";

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a dynamic species (by index into the state vector).
    LoadVar(usize),
    /// Pushes the value of a constant symbol (by index into the constant table).
    /// Parameters, compartments and boundary species all live there.
    LoadParam(usize),
    /// Pushes the simulation time.
    LoadTime,
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Tan,
    Exp,
    /// Natural logarithm.
    Ln,
    /// Base-10 logarithm.
    Log10,
    Sqrt,
    Abs,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based virtual machine for evaluating rate laws and derived symbols.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run.
/// - `vars`: current dynamic-species values (read-only).
/// - `params`: constant symbol table (read-only).
/// - `time`: the time at which the expression is evaluated.
/// - `stack`: a mutable buffer for intermediate computations.
pub struct VM;

impl VM {
    pub fn execute(
        bytecode: &Bytecode,
        vars: &[f64],
        params: &[f64],
        time: f64,
        stack: &mut Vec<f64>,
    ) -> f64 {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(*val),
                OpCode::LoadVar(idx) => stack.push(vars[*idx]),
                OpCode::LoadParam(idx) => stack.push(params[*idx]),
                OpCode::LoadTime => stack.push(time),
                OpCode::Add => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a.powf(b));
                }
                OpCode::Sin => apply_unary(stack, f64::sin),
                OpCode::Cos => apply_unary(stack, f64::cos),
                OpCode::Tan => apply_unary(stack, f64::tan),
                OpCode::Exp => apply_unary(stack, f64::exp),
                OpCode::Ln => apply_unary(stack, f64::ln),
                OpCode::Log10 => apply_unary(stack, f64::log10),
                OpCode::Sqrt => apply_unary(stack, f64::sqrt),
                OpCode::Abs => apply_unary(stack, f64::abs),
                OpCode::Neg => apply_unary(stack, |a| -a),
            }
        }

        // Compiled bytecode always leaves exactly one value. A malformed
        // program yields NaN, which the stepper reports as a non-finite state.
        stack.pop().unwrap_or(f64::NAN)
    }
}

#[inline]
fn pop_pair(stack: &mut Vec<f64>) -> (f64, f64) {
    let b = stack.pop().unwrap_or(f64::NAN);
    let a = stack.pop().unwrap_or(f64::NAN);
    (a, b)
}

#[inline]
fn apply_unary(stack: &mut Vec<f64>, f: impl Fn(f64) -> f64) {
    let a = stack.pop().unwrap_or(f64::NAN);
    stack.push(f(a));
}

// --- AST & Compiler ---

/// Abstract syntax tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),             // only '-'
    Call(String, Box<Expr>),            // functions like sin(x)
}

/// Compiles an AST (`Expr`) into `Bytecode`.
///
/// Names resolve, in order, to the reserved `time` symbol, a dynamic species,
/// a constant, or a derived expression. Derived expressions are inlined at
/// their use sites, so the VM never looks anything up by name.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
    pub expressions: HashMap<String, Expr>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let mut var_map = HashMap::new();
        for (i, name) in var_names.iter().enumerate() {
            var_map.insert(name.clone(), i);
        }

        let mut param_map = HashMap::new();
        for (i, name) in param_names.iter().enumerate() {
            param_map.insert(name.clone(), i);
        }

        Self {
            var_map,
            param_map,
            expressions: HashMap::new(),
        }
    }

    pub fn with_expressions(mut self, expressions: HashMap<String, Expr>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        let mut expanding = HashSet::new();
        self.compile_recursive(expr, &mut ops, &mut expanding)?;
        Ok(Bytecode { ops })
    }

    /// Parses and compiles in one go.
    pub fn compile_str(&self, source: &str) -> Result<Bytecode> {
        let expr = parse(source)?;
        self.compile(&expr)
    }

    fn compile_recursive<'a>(
        &'a self,
        expr: &'a Expr,
        ops: &mut Vec<OpCode>,
        expanding: &mut HashSet<&'a str>,
    ) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if name == TIME_SYMBOL {
                    ops.push(OpCode::LoadTime);
                } else if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if let Some((key, derived)) = self.expressions.get_key_value(name) {
                    if !expanding.insert(key.as_str()) {
                        return Err(SimulationError::InvalidModel(format!(
                            "expression \"{name}\" refers to itself"
                        )));
                    }
                    self.compile_recursive(derived, ops, expanding)?;
                    expanding.remove(key.as_str());
                } else {
                    return Err(SimulationError::SymbolNotFound(name.clone()));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops, expanding)?;
                self.compile_recursive(right, ops, expanding)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => {
                        return Err(SimulationError::Expression(format!(
                            "unknown binary operator '{op}'"
                        )))
                    }
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops, expanding)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => {
                        return Err(SimulationError::Expression(format!(
                            "unknown unary operator '{op}'"
                        )))
                    }
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops, expanding)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" => OpCode::Ln,
                    "log" => OpCode::Log10,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => {
                        return Err(SimulationError::Expression(format!(
                            "unknown function \"{func}\""
                        )))
                    }
                });
            }
        }
        Ok(())
    }
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SimulationError::Expression("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        return Err(SimulationError::Expression(format!(
            "unexpected trailing token {token:?} in \"{input}\""
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(['e', 'E']) {
                    // Exponent: 1e-3, 2.5E+4
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str.parse().map_err(|_| {
                SimulationError::Expression(format!("malformed number \"{num_str}\""))
            })?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => {
                    return Err(SimulationError::Expression(format!(
                        "unexpected character '{other}' in \"{input}\""
                    )))
                }
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(SimulationError::Expression("expected ')'".to_string())),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;

        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary('-', Box::new(expr)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // Right-associative: a^b^c == a^(b^c), and -a^2 == -(a^2).
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(SimulationError::Expression(format!(
                "unexpected token {token:?}"
            ))),
            None => Err(SimulationError::Expression(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str, vars: &[f64], params: &[f64], time: f64) -> f64 {
        let var_names = vec!["A".to_string(), "B".to_string()];
        let param_names = vec!["k".to_string()];
        let compiler = Compiler::new(&var_names, &param_names);
        let code = compiler.compile_str(source).expect("compile");
        let mut stack = Vec::new();
        VM::execute(&code, vars, params, time, &mut stack)
    }

    #[test]
    fn respects_operator_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[0.0, 0.0], &[0.0], 0.0), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[0.0, 0.0], &[0.0], 0.0), 9.0);
        assert_eq!(eval("2 ^ 3 ^ 2", &[0.0, 0.0], &[0.0], 0.0), 512.0);
        assert_eq!(eval("-2 ^ 2", &[0.0, 0.0], &[0.0], 0.0), -4.0);
        assert_eq!(eval("8 / 4 / 2", &[0.0, 0.0], &[0.0], 0.0), 1.0);
    }

    #[test]
    fn resolves_species_parameters_and_time() {
        let value = eval("k * A * B + time", &[2.0, 3.0], &[0.5], 10.0);
        assert!((value - 13.0).abs() < 1e-12);
    }

    #[test]
    fn tokenizes_scientific_notation() {
        assert!((eval("1e-3 * 2.5E+2", &[0.0, 0.0], &[0.0], 0.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn evaluates_functions() {
        let value = eval("exp(ln(4)) + sqrt(9) + abs(-1) + log(100)", &[0.0, 0.0], &[0.0], 0.0);
        assert!((value - 10.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_unknown_symbols() {
        let compiler = Compiler::new(&["A".to_string()], &[]);
        let err = compiler.compile_str("A * kcat").unwrap_err();
        assert_eq!(err, SimulationError::SymbolNotFound("kcat".to_string()));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(parse("1 +"), Err(SimulationError::Expression(_))));
        assert!(matches!(parse("(1 + 2"), Err(SimulationError::Expression(_))));
        assert!(matches!(parse("1 $ 2"), Err(SimulationError::Expression(_))));
        assert!(matches!(parse("1 2"), Err(SimulationError::Expression(_))));
        assert!(matches!(parse("   "), Err(SimulationError::Expression(_))));
        let compiler = Compiler::new(&[], &[]);
        assert!(matches!(
            compiler.compile_str("gamma(2)"),
            Err(SimulationError::Expression(_))
        ));
    }

    #[test]
    fn inlines_derived_expressions() {
        let mut expressions = HashMap::new();
        expressions.insert("total".to_string(), parse("A + B").unwrap());
        expressions.insert("double_total".to_string(), parse("2 * total").unwrap());
        let compiler = Compiler::new(&["A".to_string(), "B".to_string()], &[])
            .with_expressions(expressions);
        let code = compiler.compile_str("double_total + total").unwrap();
        assert!(code.ops.iter().all(|op| matches!(
            op,
            OpCode::LoadConst(_) | OpCode::LoadVar(_) | OpCode::Add | OpCode::Mul
        )));
        let mut stack = Vec::new();
        assert_eq!(VM::execute(&code, &[1.0, 2.0], &[], 0.0, &mut stack), 9.0);
    }

    #[test]
    fn detects_cyclic_expressions() {
        let mut expressions = HashMap::new();
        expressions.insert("x".to_string(), parse("y + 1").unwrap());
        expressions.insert("y".to_string(), parse("x * 2").unwrap());
        let compiler = Compiler::new(&[], &[]).with_expressions(expressions);
        let err = compiler.compile_str("x").unwrap_err();
        assert!(matches!(err, SimulationError::InvalidModel(_)));
    }

    #[test]
    fn shared_subexpressions_are_not_cycles() {
        let mut expressions = HashMap::new();
        expressions.insert("a".to_string(), parse("2").unwrap());
        expressions.insert("b".to_string(), parse("a * a").unwrap());
        let compiler = Compiler::new(&[], &[]).with_expressions(expressions);
        let code = compiler.compile_str("b + a").unwrap();
        let mut stack = Vec::new();
        assert_eq!(VM::execute(&code, &[], &[], 0.0, &mut stack), 6.0);
    }
}
