//! Transformer expressions, parsed once at startup into a small tree over a
//! closed operator set: arithmetic, comparison, boolean, indexing, calls of
//! named builtins, and the references `{self}`, `{Field}` and
//! `{Ingester.Field}`.

mod eval;
mod parser;

pub use eval::{builtin_exists, unknown_calls, EvalError};

use std::collections::BTreeSet;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    /// `{self}`: the value produced by the previous chain step.
    SelfRef,
    /// `{Field}`: another field of the same ingester, same-tick snapshot.
    FieldRef(String),
    /// `{Ingester.Field}`: latest cached value of another resource.
    CrossRef { ingester: String, field: String },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Index {
        expr: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

/// A transformer chain entry, compiled once at startup.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub source: String,
    pub expr: Expr,
    pub field_refs: BTreeSet<String>,
    pub cross_refs: BTreeSet<(String, String)>,
    pub has_self: bool,
}

impl Compiled {
    pub fn compile(source: &str) -> Result<Compiled, String> {
        let trimmed = source.trim();

        // A bare builtin name applies to {self}; a bare literal evaluates
        // to itself.
        let expr = if !trimmed.contains('{') {
            if eval::builtin_exists(trimmed) {
                Expr::Call {
                    name: trimmed.to_string(),
                    args: vec![Expr::SelfRef],
                }
            } else if let Ok(n) = trimmed.parse::<f64>() {
                Expr::Num(n)
            } else {
                parser::parse(trimmed).unwrap_or_else(|_| Expr::Str(trimmed.to_string()))
            }
        } else {
            parser::parse(trimmed)?
        };

        let mut compiled = Compiled {
            source: source.to_string(),
            expr,
            field_refs: BTreeSet::new(),
            cross_refs: BTreeSet::new(),
            has_self: false,
        };
        collect_refs(&compiled.expr.clone(), &mut compiled);
        Ok(compiled)
    }

    pub fn eval(&self, ctx: &eval::EvalCtx<'_>) -> Result<Value, EvalError> {
        eval::eval(&self.expr, ctx)
    }
}

fn collect_refs(expr: &Expr, out: &mut Compiled) {
    match expr {
        Expr::SelfRef => out.has_self = true,
        Expr::FieldRef(name) => {
            out.field_refs.insert(name.clone());
        }
        Expr::CrossRef { ingester, field } => {
            out.cross_refs.insert((ingester.clone(), field.clone()));
        }
        Expr::Unary { expr, .. } => collect_refs(expr, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_refs(lhs, out);
            collect_refs(rhs, out);
        }
        Expr::Index { expr, index } => {
            collect_refs(expr, out);
            collect_refs(index, out);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_refs(arg, out);
            }
        }
        Expr::Num(_) | Expr::Str(_) => {}
    }
}

pub use eval::EvalCtx;
