//! Safe Expression Compiler
//!
//! Parses mathematical expression strings (function plots, vector fields,
//! parametric surfaces) into closed, evaluable functions over a fixed,
//! ordered set of variables. The grammar is closed: numeric literals,
//! arithmetic operators, parentheses, an allow-list of named functions and
//! constants, and the caller's variables. Nothing else parses, so an
//! expression can never reach host objects, properties or arbitrary calls.

use std::f64::consts;
use std::fmt;
use thiserror::Error;

/// Longest expression source accepted, in characters.
pub const MAX_EXPRESSION_LEN: usize = 1_000;

/// Deepest nesting of parentheses, signs and exponents accepted.
pub const MAX_NESTING: usize = 64;

/// Reasons an expression string cannot be compiled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("expression is empty")]
    Empty,
    #[error("expression is longer than {MAX_EXPRESSION_LEN} characters")]
    TooLong,
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("malformed number '{0}'")]
    BadNumber(String),
    #[error("unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown variable '{name}' (allowed: {allowed})")]
    UnknownVariable { name: String, allowed: String },
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{0}' must be called with arguments")]
    MissingArguments(String),
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Ident(name) => write!(f, "identifier '{name}'"),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Percent => write!(f, "'%'"),
            Token::Caret => write!(f, "'^'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    pos: usize,
}

impl Spanned {
    fn unexpected(self) -> CompileError {
        CompileError::UnexpectedToken {
            found: self.token.to_string(),
            pos: self.pos,
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, CompileError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let token = match c {
            '0'..='9' | '.' => {
                let (number, next) = scan_number(&chars, i)?;
                i = next;
                Token::Number(number)
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                Token::Ident(chars[start..i].iter().collect())
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                Token::Caret
            }
            _ => {
                i += 1;
                match c {
                    '+' => Token::Plus,
                    '-' | '\u{2212}' => Token::Minus,
                    '*' | '\u{00d7}' | '\u{00b7}' => Token::Star,
                    '/' | '\u{00f7}' => Token::Slash,
                    '%' => Token::Percent,
                    '^' => Token::Caret,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    other => {
                        return Err(CompileError::UnexpectedChar {
                            ch: other,
                            pos: start,
                        });
                    }
                }
            }
        };
        tokens.push(Spanned { token, pos: start });
    }

    Ok(tokens)
}

/// Scans a decimal literal with an optional exponent. An `e` that is not
/// followed by digits is left for the caller, so `2e` reads as `2 * e`.
fn scan_number(chars: &[char], start: usize) -> Result<(f64, usize), CompileError> {
    let mut i = start;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < chars.len() && matches!(chars[i], 'e' | 'E') {
        let mut j = i + 1;
        if j < chars.len() && matches!(chars[j], '+' | '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }

    let text: String = chars[start..i].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| CompileError::BadNumber(text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl BinaryOp {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Rem => lhs % rhs,
            BinaryOp::Pow => lhs.powf(rhs),
        }
    }
}

/// The allow-listed functions. Anything not listed here is not callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Sqrt,
    Cbrt,
    Exp,
    Ln,
    Log,
    Log2,
    Log10,
    Abs,
    Floor,
    Ceil,
    Round,
    Sign,
    Min,
    Max,
    Pow,
    Hypot,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let function = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "atan2" => Function::Atan2,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "asinh" => Function::Asinh,
            "acosh" => Function::Acosh,
            "atanh" => Function::Atanh,
            "sqrt" => Function::Sqrt,
            "cbrt" => Function::Cbrt,
            "exp" => Function::Exp,
            "ln" => Function::Ln,
            "log" => Function::Log,
            "log2" => Function::Log2,
            "log10" => Function::Log10,
            "abs" => Function::Abs,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "round" => Function::Round,
            "sign" => Function::Sign,
            "min" => Function::Min,
            "max" => Function::Max,
            "pow" => Function::Pow,
            "hypot" => Function::Hypot,
            _ => return None,
        };
        Some(function)
    }

    fn check_arity(self, name: &str, got: usize) -> Result<(), CompileError> {
        let (ok, expected) = match self {
            Function::Atan2 | Function::Pow | Function::Hypot => (got == 2, "2"),
            Function::Log => ((1..=2).contains(&got), "1 or 2"),
            Function::Min | Function::Max => (got >= 1, "at least 1"),
            _ => (got == 1, "1"),
        };
        if ok {
            Ok(())
        } else {
            Err(CompileError::Arity {
                name: name.to_string(),
                expected,
                got,
            })
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        let x = args.first().copied().unwrap_or(f64::NAN);
        let y = args.get(1).copied().unwrap_or(f64::NAN);
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Asin => x.asin(),
            Function::Acos => x.acos(),
            Function::Atan => x.atan(),
            Function::Atan2 => x.atan2(y),
            Function::Sinh => x.sinh(),
            Function::Cosh => x.cosh(),
            Function::Tanh => x.tanh(),
            Function::Asinh => x.asinh(),
            Function::Acosh => x.acosh(),
            Function::Atanh => x.atanh(),
            Function::Sqrt => x.sqrt(),
            Function::Cbrt => x.cbrt(),
            Function::Exp => x.exp(),
            Function::Ln => x.ln(),
            Function::Log if args.len() == 2 => x.ln() / y.ln(),
            Function::Log => x.ln(),
            Function::Log2 => x.log2(),
            Function::Log10 => x.log10(),
            Function::Abs => x.abs(),
            Function::Floor => x.floor(),
            Function::Ceil => x.ceil(),
            Function::Round => x.round(),
            Function::Sign if x == 0.0 => 0.0,
            Function::Sign => x.signum(),
            Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Function::Pow => x.powf(y),
            Function::Hypot => x.hypot(y),
        }
    }
}

fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" | "PI" | "π" => Some(consts::PI),
        "e" | "E" => Some(consts::E),
        "tau" | "TAU" => Some(consts::TAU),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Node {
    Const(f64),
    Var(usize),
    Neg(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl Node {
    fn eval(&self, values: &[f64]) -> f64 {
        match self {
            Node::Const(value) => *value,
            Node::Var(index) => values.get(*index).copied().unwrap_or(f64::NAN),
            Node::Neg(inner) => -inner.eval(values),
            Node::Binary(op, lhs, rhs) => op.apply(lhs.eval(values), rhs.eval(values)),
            Node::Call(function, args) => {
                let evaluated: Vec<f64> = args.iter().map(|arg| arg.eval(values)).collect();
                function.apply(&evaluated)
            }
        }
    }
}

/// Recursive-descent parser. Precedence, loosest first: `+ -`, then
/// `* / %` and implicit multiplication, then unary signs, then `^`
/// (right-associative).
struct Parser<'a> {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
    variables: &'a [String],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|s| &s.token)
    }

    fn next(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.cursor).cloned();
        if spanned.is_some() {
            self.cursor += 1;
        }
        spanned
    }

    fn parse_sum(&mut self) -> Result<Node, CompileError> {
        let mut node = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.cursor += 1;
            let rhs = self.parse_product()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_product(&mut self) -> Result<Node, CompileError> {
        let mut node = self.parse_unary()?;
        loop {
            let (op, rhs) = match self.peek() {
                Some(Token::Star) => {
                    self.cursor += 1;
                    (BinaryOp::Mul, self.parse_unary()?)
                }
                Some(Token::Slash) => {
                    self.cursor += 1;
                    (BinaryOp::Div, self.parse_unary()?)
                }
                Some(Token::Percent) => {
                    self.cursor += 1;
                    (BinaryOp::Rem, self.parse_unary()?)
                }
                // Implicit multiplication: `2x`, `3(x + 1)`, `(x + 1)(x - 1)`.
                Some(Token::Number(_) | Token::Ident(_) | Token::LParen) => {
                    (BinaryOp::Mul, self.parse_power()?)
                }
                _ => break,
            };
            node = Node::Binary(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, CompileError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(CompileError::TooDeep(MAX_NESTING));
        }
        let node = match self.peek() {
            Some(Token::Minus) => {
                self.cursor += 1;
                self.parse_unary().map(|inner| Node::Neg(Box::new(inner)))
            }
            Some(Token::Plus) => {
                self.cursor += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        };
        self.depth -= 1;
        node
    }

    fn parse_power(&mut self) -> Result<Node, CompileError> {
        let base = self.parse_primary()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.cursor += 1;
            let exponent = self.parse_unary()?;
            return Ok(Node::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Node, CompileError> {
        let Some(spanned) = self.next() else {
            return Err(CompileError::UnexpectedEnd);
        };
        match spanned.token {
            Token::Number(value) => Ok(Node::Const(value)),
            Token::LParen => {
                let inner = self.parse_sum()?;
                match self.next() {
                    Some(Spanned {
                        token: Token::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(other.unexpected()),
                    None => Err(CompileError::UnexpectedEnd),
                }
            }
            Token::Ident(name) => self.parse_identifier(name),
            _ => Err(spanned.unexpected()),
        }
    }

    fn parse_identifier(&mut self, name: String) -> Result<Node, CompileError> {
        if let Some(index) = self.variables.iter().position(|v| *v == name) {
            return Ok(Node::Var(index));
        }

        let is_call = matches!(self.peek(), Some(Token::LParen));
        if let Some(function) = Function::lookup(&name) {
            if !is_call {
                return Err(CompileError::MissingArguments(name));
            }
            self.cursor += 1;
            let args = self.parse_arguments()?;
            function.check_arity(&name, args.len())?;
            return Ok(Node::Call(function, args));
        }
        if let Some(value) = constant(&name) {
            return Ok(Node::Const(value));
        }

        if is_call {
            Err(CompileError::UnknownFunction(name))
        } else {
            Err(CompileError::UnknownVariable {
                name,
                allowed: self.variables.join(", "),
            })
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Node>, CompileError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.cursor += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_sum()?);
            match self.next() {
                Some(Spanned {
                    token: Token::Comma,
                    ..
                }) => continue,
                Some(Spanned {
                    token: Token::RParen,
                    ..
                }) => return Ok(args),
                Some(other) => return Err(other.unexpected()),
                None => return Err(CompileError::UnexpectedEnd),
            }
        }
    }
}

/// A parsed expression bound to a fixed, ordered set of variable names.
///
/// Evaluation is total: domain errors and division by zero produce IEEE-754
/// `NaN`/`Infinity` rather than failing. Callers decide whether non-finite
/// results matter in their context.
#[derive(Debug)]
pub struct CompiledExpression {
    source: String,
    variables: Vec<String>,
    root: Node,
}

impl CompiledExpression {
    /// The expression as it was handed to [`compile`].
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The variable names, in the order `evaluate_at` expects their values.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Evaluates with named bindings. Variables without a binding read as `NaN`.
    pub fn evaluate(&self, bindings: &[(&str, f64)]) -> f64 {
        let values: Vec<f64> = self
            .variables
            .iter()
            .map(|name| {
                bindings
                    .iter()
                    .find(|(bound, _)| *bound == name.as_str())
                    .map(|(_, value)| *value)
                    .unwrap_or(f64::NAN)
            })
            .collect();
        self.evaluate_at(&values)
    }

    /// Evaluates with values given positionally, in `variables()` order.
    pub fn evaluate_at(&self, values: &[f64]) -> f64 {
        self.root.eval(values)
    }
}

/// Compiles `expression` against the allowed, ordered `variables`.
///
/// A `Math.` namespace prefix (as in `Math.sin(x)`) is removed first; model
/// output often mimics that idiom but the grammar has no namespaces.
pub fn compile(expression: &str, variables: &[&str]) -> Result<CompiledExpression, CompileError> {
    let stripped = expression.replace("Math.", "");
    let source = stripped.trim();
    if source.is_empty() {
        return Err(CompileError::Empty);
    }
    if source.chars().count() > MAX_EXPRESSION_LEN {
        return Err(CompileError::TooLong);
    }

    let tokens = tokenize(source)?;
    let variables: Vec<String> = variables.iter().map(|v| v.to_string()).collect();
    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
        variables: &variables,
    };
    let root = parser.parse_sum()?;
    if let Some(extra) = parser.next() {
        return Err(extra.unexpected());
    }

    Ok(CompiledExpression {
        source: expression.to_string(),
        variables,
        root,
    })
}
