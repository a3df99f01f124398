//! The expression subset evaluated server-side.
//!
//! Covers what `filter` predicates, `formula` expressions and signal `update`
//! expressions typically use: literals, `datum.field` / `datum['field']`,
//! signal references with member access, unary/binary operators, the ternary
//! conditional, and a small function library. Anything else fails to parse,
//! which makes the owning transform unsupported rather than wrong.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::{DataType, Schema};
use crate::types::Scalar;

/// Read access to the current row during evaluation.
pub trait RowAccess {
    fn get(&self, field: &str) -> Option<&Scalar>;
}

/// A row with no fields, for evaluating constant expressions.
pub struct EmptyRow;

impl RowAccess for EmptyRow {
    fn get(&self, _field: &str) -> Option<&Scalar> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::StrictEq => "===",
            BinaryOp::StrictNotEq => "!==",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::StrictEq
                | BinaryOp::StrictNotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

/// A path step after a signal name: `.name` or `[index]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Scalar),
    /// `datum.name`
    Field(String),
    /// A signal reference, replaced by a literal once bound.
    Signal {
        name: String,
        path: Vec<PathSegment>,
    },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call { func: Function, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Function {
    If,
    IsValid,
    IsNaN,
    IsFinite,
    Abs,
    Ceil,
    Floor,
    Round,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
    Lower,
    Upper,
    Length,
    ToNumber,
    ToString,
    ToBoolean,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Function> {
        Some(match name {
            "if" => Function::If,
            "isValid" => Function::IsValid,
            "isNaN" => Function::IsNaN,
            "isFinite" => Function::IsFinite,
            "abs" => Function::Abs,
            "ceil" => Function::Ceil,
            "floor" => Function::Floor,
            "round" => Function::Round,
            "sqrt" => Function::Sqrt,
            "log" => Function::Log,
            "exp" => Function::Exp,
            "pow" => Function::Pow,
            "min" => Function::Min,
            "max" => Function::Max,
            "lower" => Function::Lower,
            "upper" => Function::Upper,
            "length" => Function::Length,
            "toNumber" => Function::ToNumber,
            "toString" => Function::ToString,
            "toBoolean" => Function::ToBoolean,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::If => "if",
            Function::IsValid => "isValid",
            Function::IsNaN => "isNaN",
            Function::IsFinite => "isFinite",
            Function::Abs => "abs",
            Function::Ceil => "ceil",
            Function::Floor => "floor",
            Function::Round => "round",
            Function::Sqrt => "sqrt",
            Function::Log => "log",
            Function::Exp => "exp",
            Function::Pow => "pow",
            Function::Min => "min",
            Function::Max => "max",
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::Length => "length",
            Function::ToNumber => "toNumber",
            Function::ToString => "toString",
            Function::ToBoolean => "toBoolean",
        }
    }

    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::If => (3, Some(3)),
            Function::Pow => (2, Some(2)),
            Function::Min | Function::Max => (1, None),
            _ => (1, Some(1)),
        }
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            src,
        };
        let expr = parser.conditional()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    pub fn field(name: impl Into<String>) -> Expr {
        Expr::Field(name.into())
    }

    pub fn literal(value: Scalar) -> Expr {
        Expr::Literal(value)
    }

    /// Distinct `datum` fields referenced, in first-use order.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Field(f) = e {
                if !out.contains(f) {
                    out.push(f.clone());
                }
            }
        });
        out
    }

    /// Distinct signal names referenced, in first-use order.
    pub fn referenced_signals(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Signal { name, .. } = e {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
        });
        out
    }

    fn walk<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Field(_) | Expr::Signal { .. } => {}
            Expr::Unary { expr, .. } => expr.walk(f),
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                test.walk(f);
                then.walk(f);
                otherwise.walk(f);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(f)),
        }
    }

    /// Replace every signal reference with its current value.
    pub fn bind_signals(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<Expr> {
        Ok(match self {
            Expr::Signal { name, path } => {
                let value = lookup(name)
                    .ok_or_else(|| Error::Expression(format!("unresolved signal '{}'", name)))?;
                let mut cursor = &value;
                for seg in path {
                    cursor = match seg {
                        PathSegment::Key(k) => cursor.get(k.as_str()),
                        PathSegment::Index(i) => cursor.get(*i),
                    }
                    .unwrap_or(&Value::Null);
                }
                Expr::Literal(Scalar::from_json(cursor))
            }
            Expr::Literal(_) | Expr::Field(_) => self.clone(),
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Box::new(expr.bind_signals(lookup)?),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.bind_signals(lookup)?),
                right: Box::new(right.bind_signals(lookup)?),
            },
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => Expr::Conditional {
                test: Box::new(test.bind_signals(lookup)?),
                then: Box::new(then.bind_signals(lookup)?),
                otherwise: Box::new(otherwise.bind_signals(lookup)?),
            },
            Expr::Call { func, args } => Expr::Call {
                func: *func,
                args: args
                    .iter()
                    .map(|a| a.bind_signals(lookup))
                    .collect::<Result<_>>()?,
            },
        })
    }

    /// Result type of the expression against `schema`.
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        Ok(match self {
            Expr::Literal(s) => s.data_type().unwrap_or(DataType::Float64),
            Expr::Field(f) => schema.require(f)?.data_type,
            Expr::Signal { name, .. } => {
                return Err(Error::Expression(format!(
                    "signal '{}' must be bound before typing",
                    name
                )))
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => DataType::Boolean,
                UnaryOp::Neg | UnaryOp::Plus => {
                    expr.data_type(schema)?;
                    DataType::Float64
                }
            },
            Expr::Binary { op, left, right } => {
                let l = left.data_type(schema)?;
                let r = right.data_type(schema)?;
                if op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or) {
                    DataType::Boolean
                } else if *op == BinaryOp::Add && (l == DataType::Utf8 || r == DataType::Utf8) {
                    DataType::Utf8
                } else {
                    DataType::Float64
                }
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                test.data_type(schema)?;
                conditional_type(then.data_type(schema)?, otherwise.data_type(schema)?)
            }
            Expr::Call { func, args } => {
                let types = args
                    .iter()
                    .map(|a| a.data_type(schema))
                    .collect::<Result<Vec<_>>>()?;
                match func {
                    Function::If => conditional_type(types[1], types[2]),
                    Function::IsValid
                    | Function::IsNaN
                    | Function::IsFinite
                    | Function::ToBoolean => DataType::Boolean,
                    Function::Lower | Function::Upper | Function::ToString => DataType::Utf8,
                    _ => DataType::Float64,
                }
            }
        })
    }

    /// Evaluate against one row. Signals must already be bound.
    pub fn evaluate(&self, row: &dyn RowAccess) -> Result<Scalar> {
        Ok(match self {
            Expr::Literal(s) => s.clone(),
            Expr::Field(f) => row.get(f).cloned().unwrap_or(Scalar::Null),
            Expr::Signal { name, .. } => {
                return Err(Error::Expression(format!("unbound signal '{}'", name)))
            }
            Expr::Unary { op, expr } => {
                let v = expr.evaluate(row)?;
                match op {
                    UnaryOp::Not => Scalar::Bool(!v.truthy()),
                    UnaryOp::Neg => numeric(&v).map(|f| Scalar::F64(-f)).unwrap_or(Scalar::Null),
                    UnaryOp::Plus => numeric(&v).map(Scalar::F64).unwrap_or(Scalar::Null),
                }
            }
            Expr::Binary { op, left, right } => {
                match op {
                    BinaryOp::And => {
                        let l = left.evaluate(row)?;
                        return Ok(Scalar::Bool(l.truthy() && right.evaluate(row)?.truthy()));
                    }
                    BinaryOp::Or => {
                        let l = left.evaluate(row)?;
                        return Ok(Scalar::Bool(l.truthy() || right.evaluate(row)?.truthy()));
                    }
                    _ => {}
                }
                let l = left.evaluate(row)?;
                let r = right.evaluate(row)?;
                eval_binary(*op, &l, &r)
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                if test.evaluate(row)?.truthy() {
                    then.evaluate(row)?
                } else {
                    otherwise.evaluate(row)?
                }
            }
            Expr::Call { func, args } => {
                if *func == Function::If {
                    return if args[0].evaluate(row)?.truthy() {
                        args[1].evaluate(row)
                    } else {
                        args[2].evaluate(row)
                    };
                }
                let values = args
                    .iter()
                    .map(|a| a.evaluate(row))
                    .collect::<Result<Vec<_>>>()?;
                eval_call(*func, &values)
            }
        })
    }

    /// Evaluate an expression without row context (fields read as null).
    pub fn eval_constant(&self) -> Result<Scalar> {
        self.evaluate(&EmptyRow)
    }
}

fn conditional_type(a: DataType, b: DataType) -> DataType {
    if a == b {
        a
    } else if a.is_numeric() && b.is_numeric() {
        DataType::Float64
    } else {
        DataType::Utf8
    }
}

fn numeric(v: &Scalar) -> Option<f64> {
    v.as_f64()
}

fn is_numeric_like(v: &Scalar) -> bool {
    matches!(
        v,
        Scalar::I64(_) | Scalar::F64(_) | Scalar::Bool(_) | Scalar::Date32(_) | Scalar::Timestamp(_)
    )
}

fn loose_eq(l: &Scalar, r: &Scalar) -> bool {
    match (l, r) {
        (Scalar::Null, Scalar::Null) => true,
        (Scalar::Null, _) | (_, Scalar::Null) => false,
        (Scalar::Str(a), Scalar::Str(b)) => a == b,
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn strict_eq(l: &Scalar, r: &Scalar) -> bool {
    match (l, r) {
        (Scalar::Str(_), Scalar::Str(_)) | (Scalar::Null, Scalar::Null) => loose_eq(l, r),
        (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
        _ if is_numeric_like(l)
            && is_numeric_like(r)
            && !matches!(l, Scalar::Bool(_))
            && !matches!(r, Scalar::Bool(_)) =>
        {
            loose_eq(l, r)
        }
        _ => false,
    }
}

fn eval_binary(op: BinaryOp, l: &Scalar, r: &Scalar) -> Scalar {
    match op {
        BinaryOp::Eq => Scalar::Bool(loose_eq(l, r)),
        BinaryOp::NotEq => Scalar::Bool(!loose_eq(l, r)),
        BinaryOp::StrictEq => Scalar::Bool(strict_eq(l, r)),
        BinaryOp::StrictNotEq => Scalar::Bool(!strict_eq(l, r)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ord = match (l, r) {
                (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
                _ => {
                    // Relational operators read null as zero.
                    let a = l.as_f64().unwrap_or(0.0);
                    let b = r.as_f64().unwrap_or(0.0);
                    a.partial_cmp(&b)
                }
            };
            let Some(ord) = ord else {
                return Scalar::Bool(false);
            };
            Scalar::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::LtEq => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            })
        }
        BinaryOp::Add if matches!(l, Scalar::Str(_)) || matches!(r, Scalar::Str(_)) => {
            if l.is_null() || r.is_null() {
                Scalar::Null
            } else {
                Scalar::Str(format!("{}{}", l.to_display_string(), r.to_display_string()))
            }
        }
        _ => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Scalar::Null;
            };
            Scalar::F64(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Mod => a % b,
                // And/Or are short-circuited by the caller
                _ => f64::NAN,
            })
        }
    }
}

fn eval_call(func: Function, args: &[Scalar]) -> Scalar {
    let num1 = |g: fn(f64) -> f64| match args[0].as_f64() {
        Some(f) => Scalar::F64(g(f)),
        None => Scalar::Null,
    };
    match func {
        Function::If => Scalar::Null,
        Function::IsValid => Scalar::Bool(args[0].is_valid()),
        Function::IsNaN => Scalar::Bool(args[0].as_f64().map(f64::is_nan).unwrap_or(false)),
        Function::IsFinite => {
            Scalar::Bool(args[0].as_f64().map(f64::is_finite).unwrap_or(false))
        }
        Function::Abs => num1(f64::abs),
        Function::Ceil => num1(f64::ceil),
        Function::Floor => num1(f64::floor),
        Function::Round => num1(|f| (f + 0.5).floor()),
        Function::Sqrt => num1(f64::sqrt),
        Function::Log => num1(f64::ln),
        Function::Exp => num1(f64::exp),
        Function::Pow => match (args[0].as_f64(), args[1].as_f64()) {
            (Some(a), Some(b)) => Scalar::F64(a.powf(b)),
            _ => Scalar::Null,
        },
        Function::Min | Function::Max => {
            let mut acc: Option<f64> = None;
            for a in args {
                let Some(f) = a.as_f64() else {
                    return Scalar::Null;
                };
                if f.is_nan() {
                    return Scalar::F64(f64::NAN);
                }
                acc = Some(match (acc, func) {
                    (None, _) => f,
                    (Some(cur), Function::Min) => cur.min(f),
                    (Some(cur), _) => cur.max(f),
                });
            }
            acc.map(Scalar::F64).unwrap_or(Scalar::Null)
        }
        Function::Lower | Function::Upper | Function::ToString | Function::Length
            if args[0].is_null() =>
        {
            Scalar::Null
        }
        Function::Lower => Scalar::Str(args[0].to_display_string().to_lowercase()),
        Function::Upper => Scalar::Str(args[0].to_display_string().to_uppercase()),
        Function::ToString => Scalar::Str(args[0].to_display_string()),
        Function::Length => Scalar::F64(args[0].to_display_string().chars().count() as f64),
        Function::ToNumber => args[0].as_f64().map(Scalar::F64).unwrap_or(Scalar::Null),
        Function::ToBoolean => match &args[0] {
            Scalar::Null => Scalar::Null,
            Scalar::Str(s) if s == "false" || s == "0" => Scalar::Bool(false),
            other => Scalar::Bool(other.truthy()),
        },
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Scalar::Str(s)) => write!(f, "{}", Value::String(s.clone())),
            Expr::Literal(s) => write!(f, "{}", s.to_json()),
            Expr::Field(name) => write!(f, "datum[{}]", Value::String(name.clone())),
            Expr::Signal { name, path } => {
                write!(f, "{}", name)?;
                for seg in path {
                    match seg {
                        PathSegment::Key(k) => write!(f, "[{}]", Value::String(k.clone()))?,
                        PathSegment::Index(i) => write!(f, "[{}]", i)?,
                    }
                }
                Ok(())
            }
            Expr::Unary { op, expr } => {
                let sym = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                    UnaryOp::Plus => "+",
                };
                write!(f, "{}({})", sym, expr)
            }
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => write!(f, "({} ? {} : {})", test, then, otherwise),
            Expr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ---------------- tokenizer ----------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64, bool),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", ".", ",", "?", ":",
    "!", "+", "-", "*", "/", "%", "<", ">",
];

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                is_float |= chars[i] == '.';
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                is_float = true;
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| Error::Expression(format!("invalid number '{}'", text)))?;
            tokens.push(Token::Number(value, is_float));
        } else if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(Error::Expression(format!("unterminated string in '{}'", src)));
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&esc) = chars.get(i) else {
                        return Err(Error::Expression(format!("unterminated string in '{}'", src)));
                    };
                    i += 1;
                    s.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                } else {
                    s.push(ch);
                }
            }
            tokens.push(Token::Str(s));
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
            let Some(p) = PUNCTS.iter().find(|p| rest.starts_with(**p)) else {
                return Err(Error::Expression(format!(
                    "unexpected character '{}' in '{}'",
                    c, src
                )));
            };
            tokens.push(Token::Punct(*p));
            i += p.len();
        }
    }
    Ok(tokens)
}

// ---------------- parser ----------------

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> Error {
        Error::Expression(format!("{} at token {} in '{}'", msg, self.pos, self.src))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, p: &str) -> Result<()> {
        if self.eat(p) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", p)))
        }
    }

    fn conditional(&mut self) -> Result<Expr> {
        let test = self.binary(0)?;
        if self.eat("?") {
            let then = self.conditional()?;
            self.expect(":")?;
            let otherwise = self.conditional()?;
            return Ok(Expr::Conditional {
                test: Box::new(test),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(test)
    }

    fn binary(&mut self, level: usize) -> Result<Expr> {
        const LEVELS: &[&[(&str, BinaryOp)]] = &[
            &[("||", BinaryOp::Or)],
            &[("&&", BinaryOp::And)],
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNotEq),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::NotEq),
            ],
            &[
                ("<=", BinaryOp::LtEq),
                (">=", BinaryOp::GtEq),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Mod)],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut left = self.binary(level + 1)?;
        'outer: loop {
            for (sym, op) in LEVELS[level] {
                if self.eat(sym) {
                    let right = self.binary(level + 1)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = if self.eat("!") {
            UnaryOp::Not
        } else if self.eat("-") {
            UnaryOp::Neg
        } else if self.eat("+") {
            UnaryOp::Plus
        } else {
            return self.postfix();
        };
        let expr = self.unary()?;
        // Fold negative numeric literals.
        if let (UnaryOp::Neg, Expr::Literal(lit)) = (op, &expr) {
            match lit {
                Scalar::I64(i) => return Ok(Expr::Literal(Scalar::I64(-i))),
                Scalar::F64(f) => return Ok(Expr::Literal(Scalar::F64(-f))),
                _ => {}
            }
        }
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    /// Member key after `.` or inside `[...]`.
    fn member(&mut self) -> Result<Option<PathSegment>> {
        if self.eat(".") {
            return match self.tokens.get(self.pos).cloned() {
                Some(Token::Ident(name)) => {
                    self.pos += 1;
                    Ok(Some(PathSegment::Key(name)))
                }
                _ => Err(self.error("expected property name")),
            };
        }
        if self.eat("[") {
            let seg = match self.tokens.get(self.pos).cloned() {
                Some(Token::Str(s)) => PathSegment::Key(s),
                Some(Token::Number(n, false)) if n >= 0.0 => PathSegment::Index(n as usize),
                _ => return Err(self.error("only literal member access is supported")),
            };
            self.pos += 1;
            self.expect("]")?;
            return Ok(Some(seg));
        }
        Ok(None)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Number(n, is_float) => Ok(Expr::Literal(
                if !is_float && n.abs() < 9.007_199_254_740_992e15 {
                    Scalar::I64(n as i64)
                } else {
                    Scalar::F64(n)
                },
            )),
            Token::Str(s) => Ok(Expr::Literal(Scalar::Str(s))),
            Token::Punct("(") => {
                let e = self.conditional()?;
                self.expect(")")?;
                Ok(e)
            }
            Token::Ident(name) => self.identifier(name),
            Token::Punct(p) => Err(self.error(&format!("unexpected '{}'", p))),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Expr> {
        match name.as_str() {
            "true" => return Ok(Expr::Literal(Scalar::Bool(true))),
            "false" => return Ok(Expr::Literal(Scalar::Bool(false))),
            "null" => return Ok(Expr::Literal(Scalar::Null)),
            "NaN" => return Ok(Expr::Literal(Scalar::F64(f64::NAN))),
            "Infinity" => return Ok(Expr::Literal(Scalar::F64(f64::INFINITY))),
            "PI" => return Ok(Expr::Literal(Scalar::F64(std::f64::consts::PI))),
            "E" => return Ok(Expr::Literal(Scalar::F64(std::f64::consts::E))),
            "datum" => {
                return match self.member()? {
                    Some(PathSegment::Key(field)) => {
                        if matches!(self.peek(), Some(Token::Punct(".")) | Some(Token::Punct("["))) {
                            Err(self.error("nested datum access is not supported"))
                        } else {
                            Ok(Expr::Field(field))
                        }
                    }
                    _ => Err(self.error("expected field access on datum")),
                };
            }
            _ => {}
        }

        if self.eat("(") {
            let func = Function::lookup(&name)
                .ok_or_else(|| Error::Expression(format!("unsupported function '{}'", name)))?;
            let mut args = Vec::new();
            if !self.eat(")") {
                loop {
                    args.push(self.conditional()?);
                    if self.eat(")") {
                        break;
                    }
                    self.expect(",")?;
                }
            }
            let (min, max) = func.arity();
            if args.len() < min || max.is_some_and(|m| args.len() > m) {
                return Err(Error::Expression(format!(
                    "wrong number of arguments to '{}': {}",
                    name,
                    args.len()
                )));
            }
            return Ok(Expr::Call { func, args });
        }

        let mut path = Vec::new();
        while let Some(seg) = self.member()? {
            path.push(seg);
        }
        Ok(Expr::Signal { name, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use serde_json::json;

    struct MapRow(Vec<(&'static str, Scalar)>);

    impl RowAccess for MapRow {
        fn get(&self, field: &str) -> Option<&Scalar> {
            self.0.iter().find(|(k, _)| *k == field).map(|(_, v)| v)
        }
    }

    #[test]
    fn parses_datum_access_and_precedence() {
        let e = Expr::parse("datum.a + datum['b c'] * 2 > 10 && !isValid(datum.z)").unwrap();
        assert_eq!(e.referenced_fields(), vec!["a", "b c", "z"]);
        let row = MapRow(vec![("a", Scalar::I64(4)), ("b c", Scalar::F64(3.5))]);
        assert_eq!(e.evaluate(&row).unwrap(), Scalar::Bool(true));
    }

    #[test]
    fn binds_signal_paths() {
        let e = Expr::parse("datum.x >= ext[0] && datum.x <= ext[1]").unwrap();
        assert_eq!(e.referenced_signals(), vec!["ext"]);
        assert!(e.evaluate(&EmptyRow).is_err());
        let bound = e
            .bind_signals(&|name| (name == "ext").then(|| json!([1, 5])))
            .unwrap();
        let row = MapRow(vec![("x", Scalar::I64(3))]);
        assert_eq!(bound.evaluate(&row).unwrap(), Scalar::Bool(true));
        assert!(e.bind_signals(&|_| None).is_err());
    }

    #[test]
    fn infers_types() {
        let schema = Schema::new(vec![
            Field::new("n", DataType::Int64, false),
            Field::new("s", DataType::Utf8, false),
        ]);
        let t = |src: &str| Expr::parse(src).unwrap().data_type(&schema).unwrap();
        assert_eq!(t("datum.n * 2"), DataType::Float64);
        assert_eq!(t("datum.s + '!'"), DataType::Utf8);
        assert_eq!(t("datum.n > 1"), DataType::Boolean);
        assert_eq!(t("upper(datum.s)"), DataType::Utf8);
        let missing = Expr::parse("datum.missing").unwrap();
        assert!(missing.data_type(&schema).is_err());
    }

    #[test]
    fn rejects_unknown_functions_and_syntax() {
        assert!(Expr::parse("format(datum.a, '.2f')").is_err());
        assert!(Expr::parse("datum.a +").is_err());
        assert!(Expr::parse("datum.a.b").is_err());
    }

    #[test]
    fn null_propagates_through_arithmetic() {
        let e = Expr::parse("datum.a * 2").unwrap();
        let row = MapRow(vec![("a", Scalar::Null)]);
        assert_eq!(e.evaluate(&row).unwrap(), Scalar::Null);
        let c = Expr::parse("datum.a == null ? 'none' : 'some'").unwrap();
        assert_eq!(c.evaluate(&row).unwrap(), Scalar::Str("none".into()));
    }

    #[test]
    fn display_reparses() {
        let e = Expr::parse("-datum.a / 2 + (sig.k ? 1 : -3)").unwrap();
        let again = Expr::parse(&e.to_string()).unwrap();
        assert_eq!(e, again);
    }
}
