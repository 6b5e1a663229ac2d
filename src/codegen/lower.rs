//! Lowering of a guarded expression sequence into flat C99 statements.
//!
//! Repeated subtrees are factored into `x{n}` temporaries across the whole
//! sequence (assertions included), then the sequence is rendered in its
//! original order. Output is deterministic: the same input always produces
//! byte-identical text.

use std::fmt;

use super::c_ast::{render_stmts, CseBuilder, CseConfig, Stmt};
use super::volume::GuardedExpr;

/// First line of every generated body.
pub const GENERATED_NOTICE: &str =
    "This source was generated by the collision volume code generator. Do not edit.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerError {
    /// The sequence carries no named result to assign to.
    MissingResult,
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::MissingResult => {
                write!(f, "expression sequence contains no named result")
            }
        }
    }
}

impl std::error::Error for LowerError {}

/// An ordered, immutable body of generated statements.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredCodeBody {
    stmts: Vec<Stmt>,
}

impl LoweredCodeBody {
    pub(crate) fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.stmts
    }

    pub fn to_c99(&self) -> String {
        render_stmts(&self.stmts)
    }
}

/// Lower the sequence: CSE across all entries, then one statement per entry
/// in the input order (assertions as `assert(...)`, the named result as an
/// assignment), preceded by the temporaries and the generated-code notice.
pub fn lower(exprs: &[GuardedExpr]) -> Result<LoweredCodeBody, LowerError> {
    if !exprs.iter().any(|entry| entry.name.is_some()) {
        return Err(LowerError::MissingResult);
    }

    let roots: Vec<_> = exprs.iter().map(|entry| entry.expr).collect();
    let config = CseConfig {
        // Small stencil: factor every repeated compound subtree.
        max_bindings: usize::MAX,
        ..CseConfig::default()
    };
    let mut builder = CseBuilder::with_config("x", config);
    let (temps, new_roots) = builder.eliminate(&roots);

    let mut stmts = Vec::with_capacity(temps.len() + exprs.len() + 1);
    stmts.push(Stmt::Comment(GENERATED_NOTICE.to_string()));
    stmts.extend(temps);
    for (entry, root) in exprs.iter().zip(new_roots) {
        match entry.name {
            None => stmts.push(Stmt::Assert(root)),
            Some(name) => stmts.push(Stmt::Assign {
                name: name.to_string(),
                expr: root,
            }),
        }
    }

    Ok(LoweredCodeBody::new(stmts))
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use rand::Rng;

    use super::super::c_ast::eval::{eval, eval_bool};
    use super::super::c_ast::Expr;
    use super::super::symbols::vec2_symbols;
    use super::super::volume::volume_formula;
    use super::*;

    fn volume_body() -> LoweredCodeBody {
        let v = vec2_symbols('V');
        let u = vec2_symbols('U');
        lower(&volume_formula(&v, &u)).expect("volume sequence lowers")
    }

    /// Execute a lowered body the way the generated C would run: declarations
    /// extend the environment, assertions must hold, assignments bind their
    /// target. Returns the environment after the last statement.
    fn run_body(body: &LoweredCodeBody, env: &mut IndexMap<String, f64>) {
        for stmt in body.stmts() {
            match stmt {
                Stmt::Comment(_) => {}
                Stmt::Decl { name, expr } | Stmt::Assign { name, expr } => {
                    let value = match expr.try_piecewise() {
                        Some((cond, then_value, else_value)) => {
                            if eval_bool(cond, env) {
                                eval(then_value, env)
                            } else {
                                eval(else_value, env)
                            }
                        }
                        None => eval(*expr, env),
                    };
                    env.insert(name.clone(), value);
                }
                Stmt::Assert(expr) => assert!(eval_bool(*expr, env), "assertion failed: {expr}"),
            }
        }
    }

    fn random_env(rng: &mut impl Rng) -> IndexMap<String, f64> {
        let mut env = IndexMap::new();
        for prefix in ['V', 'U'] {
            for letter in ['i', 'j', 'k', 'l'] {
                for component in [0, 1] {
                    env.insert(
                        format!("{prefix}{letter}[{component}]"),
                        rng.gen_range(-2.0..2.0),
                    );
                }
            }
        }
        env.insert("toi".to_string(), rng.gen_range(0.0..1.0));
        env.insert("alpha".to_string(), rng.gen_range(0.0..1.0));
        env.insert("epsilon".to_string(), rng.gen_range(1e-6..1e-2));
        env
    }

    #[test]
    fn lowering_rejects_sequences_without_a_named_result() {
        assert_eq!(lower(&[]), Err(LowerError::MissingResult));

        let assertion_only = [super::super::volume::GuardedExpr::assertion(
            Expr::ident("epsilon").gt(0.0),
        )];
        assert_eq!(lower(&assertion_only), Err(LowerError::MissingResult));
    }

    #[test]
    fn lowered_body_starts_with_notice_and_ends_with_volume_assignment() {
        let text = volume_body().to_c99();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(format!("// {GENERATED_NOTICE}").as_str()));
        assert!(text.trim_end().ends_with("}"), "{text}");
        assert!(text.contains("volume = "), "{text}");
    }

    #[test]
    fn lowered_body_keeps_assertion_order() {
        let text = volume_body().to_c99();
        let asserts: Vec<&str> = text
            .lines()
            .filter(|line| line.trim_start().starts_with("assert("))
            .collect();
        assert_eq!(asserts.len(), 2, "{text}");
        // Edge-length guard first, regularization disjunction second.
        assert!(!asserts[0].contains("||"), "{}", asserts[0]);
        assert!(asserts[1].contains("epsilon > 0.0 ||"), "{}", asserts[1]);
    }

    #[test]
    fn lowering_is_deterministic() {
        let first = volume_body().to_c99();
        let second = volume_body().to_c99();
        assert_eq!(first, second);
    }

    #[test]
    fn no_compound_subtree_is_emitted_twice() {
        let text = volume_body().to_c99();
        let mut rhs_seen = Vec::new();
        for line in text.lines() {
            let Some(assign) = line.trim().strip_suffix(';') else {
                continue;
            };
            let Some((_, rhs)) = assign.split_once(" = ") else {
                continue;
            };
            // A repeated sqrt (the most expensive node here) would mean CSE
            // missed a shared subtree.
            if rhs.contains("sqrt") {
                assert!(
                    !rhs_seen.iter().any(|seen: &String| seen == rhs),
                    "duplicate rhs: {rhs}"
                );
            }
            rhs_seen.push(rhs.to_string());
        }
        // Two distinct radicals exist (edge length, regularized volume);
        // each must be computed exactly once.
        assert_eq!(text.matches("sqrt(").count(), 2, "{text}");
    }

    #[test]
    fn executed_body_matches_unlowered_algebra() {
        let v = vec2_symbols('V');
        let u = vec2_symbols('U');
        let exprs = volume_formula(&v, &u);
        let body = lower(&exprs).expect("lowers");

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut env = random_env(&mut rng);
            let expected = eval(exprs[2].expr, &env);
            run_body(&body, &mut env);
            let actual = env["volume"];
            assert!(
                (expected - actual).abs() <= 1e-12 * expected.abs().max(1.0),
                "mismatch: {expected} vs {actual}"
            );
        }
    }
}
