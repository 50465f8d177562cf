//! A compact interpreter for lowered top-level bodies.
//!
//! Lowered code is a flat statement list: each statement's value lands in
//! its ssa slot, branches are `Goto`/`GotoIfNot` with 1-based statement
//! labels, and `return` leaves the body. This is the non-compiled path of
//! the thunk decision; it also evaluates the simple expressions the
//! top-level dispatcher hands over directly.

use super::{apply, eval_global_var};
use crate::exceptions;
use crate::module::Module;
use crate::sym::syms;
use crate::value::{CodeInfo, Expr, RtError, Value};
use std::sync::Arc;

/// Evaluate an atom or simple expression against `m`.
pub fn eval_value(m: &Arc<Module>, v: &Value) -> Value {
    eval_op(m, v, &[])
}

fn eval_op(m: &Arc<Module>, v: &Value, ssa: &[Value]) -> Value {
    match v {
        Value::Sym(s) => eval_global_var(m, *s),
        Value::GlobalRef(gm, s) => eval_global_var(gm, *s),
        Value::Quote(inner) => (**inner).clone(),
        Value::LineNode(..) => Value::Nothing,
        Value::Ssa(k) => {
            let idx = (*k as usize).checked_sub(1).unwrap_or(usize::MAX);
            match ssa.get(idx) {
                Some(v) => v.clone(),
                None => exceptions::throw(Value::error(format!(
                    "reference to out-of-range ssa value %{}",
                    k
                ))),
            }
        }
        Value::Expr(e) => eval_expr(m, e, ssa),
        other => other.clone(),
    }
}

fn eval_expr(m: &Arc<Module>, e: &Arc<Expr>, ssa: &[Value]) -> Value {
    let s = syms();
    if e.head == s.call {
        let f = match e.args.first() {
            Some(f) => eval_op(m, f, ssa),
            None => exceptions::throw(Value::error("malformed call expression")),
        };
        let args: Vec<Value> = e.args[1..].iter().map(|a| eval_op(m, a, ssa)).collect();
        apply(&f, &args)
    } else if e.head == s.block {
        let mut res = Value::Nothing;
        for a in &e.args {
            res = eval_op(m, a, ssa);
        }
        res
    } else if e.head == s.assign {
        let rhs = match e.args.get(1) {
            Some(rhs) => eval_op(m, rhs, ssa),
            None => exceptions::throw(Value::error("malformed assignment")),
        };
        match e.args.get(0) {
            Some(Value::Sym(gs)) => {
                if let Err(err) = m.set_global(*gs, rhs.clone()) {
                    exceptions::throw(err);
                }
            }
            Some(Value::GlobalRef(gm, gs)) => {
                if let Err(err) = gm.set_global(*gs, rhs.clone()) {
                    exceptions::throw(err);
                }
            }
            other => exceptions::throw(RtError::type_error(
                "assignment",
                "Symbol",
                other.unwrap_or(&Value::Nothing),
            )),
        }
        rhs
    } else if e.head == s.meta {
        Value::Nothing
    } else {
        exceptions::throw(Value::error(format!(
            "unsupported expression head `{}` in the interpreter",
            e.head
        )))
    }
}

/// Run a lowered body to completion and return its value.
pub fn interpret_thunk(m: &Arc<Module>, code: &Arc<CodeInfo>) -> Value {
    let stmts: Vec<Value> = code.code.lock().unwrap().clone();
    let n = stmts.len();
    let mut ssa: Vec<Value> = vec![Value::Nothing; n];
    let mut i = 0usize;
    while i < n {
        match &stmts[i] {
            Value::Goto(l) => {
                i = label_to_index(*l, n);
                continue;
            }
            Value::GotoIfNot(cond, l) => {
                let cond = eval_op(m, cond, &ssa);
                match cond.as_bool() {
                    Some(true) => {}
                    Some(false) => {
                        i = label_to_index(*l, n);
                        continue;
                    }
                    None => exceptions::throw(RtError::type_error("if", "Bool", &cond)),
                }
                ssa[i] = Value::Nothing;
            }
            stmt => {
                if let Some(e) = stmt.as_expr() {
                    if e.head == syms().r#return {
                        return match e.args.first() {
                            Some(v) => eval_op(m, v, &ssa),
                            None => Value::Nothing,
                        };
                    }
                }
                ssa[i] = eval_op(m, stmt, &ssa);
            }
        }
        i += 1;
    }
    // Fell off the end: the body's value is the last statement's.
    ssa.last().cloned().unwrap_or(Value::Nothing)
}

fn label_to_index(label: u32, n: usize) -> usize {
    let idx = (label as usize).wrapping_sub(1);
    if idx >= n {
        exceptions::throw(Value::error(format!(
            "branch to out-of-range label {}",
            label
        )));
    }
    idx
}

/// Rewrite bare symbols in a lowered body into globals rooted in `m`,
/// leaving quoted values untouched. Compiled bodies and opaque-closure
/// bodies need every reference anchored before they leave the evaluator.
pub fn resolve_globals_in_ir(code: &Arc<CodeInfo>, m: &Arc<Module>) {
    let mut stmts = code.code.lock().unwrap();
    for stmt in stmts.iter_mut() {
        *stmt = resolve_value(stmt, m);
    }
}

fn resolve_value(v: &Value, m: &Arc<Module>) -> Value {
    match v {
        Value::Sym(s) => Value::GlobalRef(m.clone(), *s),
        Value::GotoIfNot(cond, l) => Value::GotoIfNot(Arc::new(resolve_value(cond, m)), *l),
        Value::Expr(e) => {
            if e.head == syms().meta {
                return v.clone();
            }
            let args = e.args.iter().map(|a| resolve_value(a, m)).collect();
            Expr::value(e.head, args)
        }
        other => other.clone(),
    }
}
