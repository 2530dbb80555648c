use ecow::EcoString;
use serde::{Deserialize, Serialize};

use crate::{
    parser::{BinaryOp, BoolOp, Span, UnaryOp},
    values::Value,
};

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: EcoString,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal template text.
    Text(EcoString),
    /// `[% expr %]`
    Print(Expr),
    /// `IF`/`ELSIF`/`ELSE` chain; `UNLESS` is an `If` with a negated condition.
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Option<Vec<Node>>,
    },
    Foreach {
        var: EcoString,
        iterable: Expr,
        body: Vec<Node>,
    },
    While {
        cond: Expr,
        body: Vec<Node>,
    },
    Set {
        name: EcoString,
        value: Expr,
    },
    Macro {
        name: EcoString,
        params: Vec<(EcoString, Span)>,
        body: Vec<Node>,
    },
    Include {
        template: Expr,
        args: Vec<(EcoString, Expr)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    List(Vec<Expr>),
    Var(EcoString),
    Attr {
        object: Box<Expr>,
        field: EcoString,
    },
    Index {
        collection: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: Box<Expr>,
        args: Vec<Expr>,
    },
    Filter {
        expr: Box<Expr>,
        name: EcoString,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Bool {
        op: BoolOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Literal values; also the element type of a program's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Undef,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(EcoString),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Undef => Value::Undef,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::Str(s.clone()),
        }
    }
}
