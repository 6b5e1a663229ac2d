//! C99 scalar-expression AST and statement rendering.
//!
//! Expressions are interned in a thread-local arena and addressed by a
//! `Copy` id, so formula-construction code can pass them around freely and
//! combine them with the usual operators. Rendering is precedence-aware and
//! deterministic: the same tree always prints the same text.

use std::cell::RefCell;
use std::fmt;

use indexmap::{IndexMap, IndexSet};

/// One emitted statement of a generated code body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Comment(String),
    /// `double {name} = {expr};`
    Decl { name: String, expr: Expr },
    /// `{name} = {expr};` — the target is declared by the embedding code.
    /// A piecewise right-hand side renders as an `if`/`else` statement.
    Assign { name: String, expr: Expr },
    /// `assert({expr});`
    Assert(Expr),
}

impl Stmt {
    pub(crate) fn render(&self, ctx: &mut RenderContext<'_>) {
        match self {
            Stmt::Comment(text) => ctx.line(&format!("// {}", text)),
            Stmt::Decl { name, expr } => {
                ctx.line(&format!("double {} = {};", name, expr));
            }
            Stmt::Assign { name, expr } => {
                if let Some((cond, then_value, else_value)) = expr.try_piecewise() {
                    ctx.line(&format!("if ({}) {{", cond));
                    ctx.indent();
                    ctx.line(&format!("{} = {};", name, then_value));
                    ctx.dedent();
                    ctx.line("} else {");
                    ctx.indent();
                    ctx.line(&format!("{} = {};", name, else_value));
                    ctx.dedent();
                    ctx.line("}");
                } else {
                    ctx.line(&format!("{} = {};", name, expr));
                }
            }
            Stmt::Assert(expr) => ctx.line(&format!("assert({});", expr)),
        }
    }

    /// Rebuild every expression in this statement through `f`.
    pub fn map_exprs(&self, f: &mut impl FnMut(Expr) -> Expr) -> Stmt {
        match self {
            Stmt::Comment(text) => Stmt::Comment(text.clone()),
            Stmt::Decl { name, expr } => Stmt::Decl {
                name: name.clone(),
                expr: f(*expr),
            },
            Stmt::Assign { name, expr } => Stmt::Assign {
                name: name.clone(),
                expr: f(*expr),
            },
            Stmt::Assert(expr) => Stmt::Assert(f(*expr)),
        }
    }
}

/// Render a statement list to text, one statement per line (nested blocks
/// indented by four spaces).
pub fn render_stmts(stmts: &[Stmt]) -> String {
    let mut out = String::new();
    let mut ctx = RenderContext::new(&mut out);
    for stmt in stmts {
        stmt.render(&mut ctx);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expr(u32);

#[derive(Debug, Clone)]
enum ExprNode {
    Literal(Literal),
    Ident(String),
    Index {
        base: Expr,
        index: Expr,
    },
    Unary {
        op: UnaryOp,
        expr: Expr,
    },
    Binary {
        left: Expr,
        op: BinaryOp,
        right: Expr,
    },
    Call {
        callee: Expr,
        args: Vec<Expr>,
    },
    Piecewise {
        cond: Expr,
        then_value: Expr,
        else_value: Expr,
    },
}

thread_local! {
    static EXPR_ARENA: RefCell<Vec<ExprNode>> = RefCell::new(Vec::new());
}

impl Expr {
    fn alloc(node: ExprNode) -> Self {
        EXPR_ARENA.with(|arena| {
            let mut arena = arena.borrow_mut();
            let id = u32::try_from(arena.len()).expect("expression arena overflow");
            arena.push(node);
            Expr(id)
        })
    }

    fn with_node<R>(self, f: impl FnOnce(&ExprNode) -> R) -> R {
        EXPR_ARENA.with(|arena| {
            let arena = arena.borrow();
            let node = arena
                .get(self.0 as usize)
                .unwrap_or_else(|| panic!("invalid Expr id {}", self.0));
            f(node)
        })
    }

    fn unary(op: UnaryOp, expr: Expr) -> Self {
        Expr::alloc(ExprNode::Unary { op, expr })
    }

    fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::alloc(ExprNode::Binary { left, op, right })
    }

    fn format_f64_literal(value: f64) -> String {
        if value.is_nan() {
            return "NAN".to_string();
        }
        if value.is_infinite() {
            return if value.is_sign_positive() {
                "INFINITY".to_string()
            } else {
                "-INFINITY".to_string()
            };
        }
        let mut out = format!("{value}");
        if !out.contains('.') && !out.contains('e') && !out.contains('E') {
            out.push_str(".0");
        }
        out
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expr::alloc(ExprNode::Ident(name.into()))
    }

    pub fn lit_i64(value: i64) -> Self {
        Expr::alloc(ExprNode::Literal(Literal::Int(value)))
    }

    pub fn lit_f64(value: f64) -> Self {
        Expr::alloc(ExprNode::Literal(Literal::Float(Self::format_f64_literal(
            value,
        ))))
    }

    pub fn index(self, index: impl Into<Expr>) -> Self {
        Expr::alloc(ExprNode::Index {
            base: self,
            index: index.into(),
        })
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        Expr::alloc(ExprNode::Call { callee, args })
    }

    pub fn call_named(name: &str, args: Vec<Expr>) -> Self {
        Expr::call(Expr::ident(name), args)
    }

    pub fn sqrt(self) -> Self {
        Expr::call_named("sqrt", vec![self])
    }

    /// Runtime-conditional expression. Renders as a C ternary, or as an
    /// `if`/`else` statement when it is the right-hand side of an assignment.
    pub fn piecewise(cond: Expr, then_value: Expr, else_value: Expr) -> Self {
        Expr::alloc(ExprNode::Piecewise {
            cond,
            then_value,
            else_value,
        })
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(self, BinaryOp::Less, rhs.into())
    }

    pub fn le(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(self, BinaryOp::LessEq, rhs.into())
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(self, BinaryOp::Greater, rhs.into())
    }

    pub fn ge(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(self, BinaryOp::GreaterEq, rhs.into())
    }

    pub fn eq(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(self, BinaryOp::Equal, rhs.into())
    }

    pub fn ne(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(self, BinaryOp::NotEqual, rhs.into())
    }

    pub fn try_piecewise(self) -> Option<(Expr, Expr, Expr)> {
        self.with_node(|node| match node {
            ExprNode::Piecewise {
                cond,
                then_value,
                else_value,
            } => Some((*cond, *then_value, *else_value)),
            _ => None,
        })
    }

    /// `name[index]` where the base is a plain identifier and the index a
    /// plain integer literal, i.e. a scalar symbol spelled with C array
    /// syntax. These are the leaves of the stencil formulas.
    pub fn try_indexed_ident(self) -> Option<(String, i64)> {
        self.with_node(|node| match node {
            ExprNode::Index { base, index } => base.with_node(|base_node| {
                let ExprNode::Ident(name) = base_node else {
                    return None;
                };
                index.with_node(|index_node| match index_node {
                    ExprNode::Literal(Literal::Int(value)) => Some((name.clone(), *value)),
                    _ => None,
                })
            }),
            _ => None,
        })
    }

    /// Rebuild this tree, replacing each `name[index]` symbol for which `f`
    /// returns a new name with a plain identifier of that name. Everything
    /// else is preserved structurally.
    pub fn rewrite_indexed_idents(self, f: &mut impl FnMut(&str, i64) -> Option<String>) -> Expr {
        if let Some((name, index)) = self.try_indexed_ident() {
            return match f(&name, index) {
                Some(new_name) => Expr::ident(new_name),
                None => self,
            };
        }

        // Clone the node out before allocating to avoid re-borrowing the arena.
        let node = self.with_node(|node| node.clone());
        match node {
            ExprNode::Literal(_) | ExprNode::Ident(_) => self,
            ExprNode::Index { base, index } => {
                let new_base = base.rewrite_indexed_idents(f);
                let new_index = index.rewrite_indexed_idents(f);
                if new_base == base && new_index == index {
                    self
                } else {
                    new_base.index(new_index)
                }
            }
            ExprNode::Unary { op, expr } => {
                let new_expr = expr.rewrite_indexed_idents(f);
                if new_expr == expr {
                    self
                } else {
                    Expr::unary(op, new_expr)
                }
            }
            ExprNode::Binary { left, op, right } => {
                let new_left = left.rewrite_indexed_idents(f);
                let new_right = right.rewrite_indexed_idents(f);
                if new_left == left && new_right == right {
                    self
                } else {
                    Expr::binary(new_left, op, new_right)
                }
            }
            ExprNode::Call { callee, args } => {
                let new_callee = callee.rewrite_indexed_idents(f);
                let new_args: Vec<Expr> = args
                    .iter()
                    .map(|arg| arg.rewrite_indexed_idents(f))
                    .collect();
                if new_callee == callee && new_args == args {
                    self
                } else {
                    Expr::call(new_callee, new_args)
                }
            }
            ExprNode::Piecewise {
                cond,
                then_value,
                else_value,
            } => {
                let new_cond = cond.rewrite_indexed_idents(f);
                let new_then = then_value.rewrite_indexed_idents(f);
                let new_else = else_value.rewrite_indexed_idents(f);
                if new_cond == cond && new_then == then_value && new_else == else_value {
                    self
                } else {
                    Expr::piecewise(new_cond, new_then, new_else)
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_expr(*self, f, Precedence::Lowest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Literal {
    Int(i64),
    Float(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(value) => write!(f, "{}", value),
            Literal::Float(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum UnaryOp {
    Negate,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Negate => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equal,
    NotEqual,
    And,
    Or,
}

impl BinaryOp {
    fn precedence(self) -> Precedence {
        match self {
            BinaryOp::Or => Precedence::Or,
            BinaryOp::And => Precedence::And,
            BinaryOp::Equal | BinaryOp::NotEqual => Precedence::Equality,
            BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
                Precedence::Comparison
            }
            BinaryOp::Add | BinaryOp::Sub => Precedence::Sum,
            BinaryOp::Mul | BinaryOp::Div => Precedence::Product,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Sub => write!(f, "-"),
            BinaryOp::Mul => write!(f, "*"),
            BinaryOp::Div => write!(f, "/"),
            BinaryOp::Less => write!(f, "<"),
            BinaryOp::LessEq => write!(f, "<="),
            BinaryOp::Greater => write!(f, ">"),
            BinaryOp::GreaterEq => write!(f, ">="),
            BinaryOp::Equal => write!(f, "=="),
            BinaryOp::NotEqual => write!(f, "!="),
            BinaryOp::And => write!(f, "&&"),
            BinaryOp::Or => write!(f, "||"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Sum,
    Product,
    Prefix,
    Postfix,
}

fn next_precedence(prec: Precedence) -> Precedence {
    match prec {
        Precedence::Lowest => Precedence::Ternary,
        Precedence::Ternary => Precedence::Or,
        Precedence::Or => Precedence::And,
        Precedence::And => Precedence::Equality,
        Precedence::Equality => Precedence::Comparison,
        Precedence::Comparison => Precedence::Sum,
        Precedence::Sum => Precedence::Product,
        Precedence::Product => Precedence::Prefix,
        Precedence::Prefix | Precedence::Postfix => Precedence::Postfix,
    }
}

fn render_expr(expr: Expr, f: &mut fmt::Formatter<'_>, parent_prec: Precedence) -> fmt::Result {
    expr.with_node(|node| match node {
        ExprNode::Literal(lit) => write!(f, "{}", lit),
        ExprNode::Ident(name) => write!(f, "{}", name),
        ExprNode::Index { base, index } => {
            let needs_paren = expr_precedence(*base) < Precedence::Postfix;
            if needs_paren {
                write!(f, "(")?;
            }
            render_expr(*base, f, Precedence::Postfix)?;
            if needs_paren {
                write!(f, ")")?;
            }
            write!(f, "[")?;
            render_expr(*index, f, Precedence::Lowest)?;
            write!(f, "]")
        }
        ExprNode::Unary { op, expr } => {
            let prec = Precedence::Prefix;
            let needs_paren = prec < parent_prec;
            if needs_paren {
                write!(f, "(")?;
            }
            write!(f, "{}", op)?;
            render_expr(*expr, f, prec)?;
            if needs_paren {
                write!(f, ")")?;
            }
            Ok(())
        }
        ExprNode::Binary { left, op, right } => {
            let prec = op.precedence();
            let needs_paren = prec < parent_prec;
            if needs_paren {
                write!(f, "(")?;
            }
            render_expr(*left, f, prec)?;
            write!(f, " {} ", op)?;
            // Subtraction and division are not associative; preserve RHS grouping.
            let right_prec = match op {
                BinaryOp::Sub | BinaryOp::Div => next_precedence(prec),
                _ => prec,
            };
            render_expr(*right, f, right_prec)?;
            if needs_paren {
                write!(f, ")")?;
            }
            Ok(())
        }
        ExprNode::Call { callee, args } => {
            let needs_paren = expr_precedence(*callee) < Precedence::Postfix;
            if needs_paren {
                write!(f, "(")?;
            }
            render_expr(*callee, f, Precedence::Postfix)?;
            if needs_paren {
                write!(f, ")")?;
            }
            write!(f, "(")?;
            for (idx, arg) in args.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                render_expr(*arg, f, Precedence::Lowest)?;
            }
            write!(f, ")")
        }
        ExprNode::Piecewise {
            cond,
            then_value,
            else_value,
        } => {
            let prec = Precedence::Ternary;
            let needs_paren = prec < parent_prec;
            if needs_paren {
                write!(f, "(")?;
            }
            render_expr(*cond, f, Precedence::Or)?;
            write!(f, " ? ")?;
            render_expr(*then_value, f, Precedence::Lowest)?;
            write!(f, " : ")?;
            // Right-associative: the else arm may itself be a conditional.
            render_expr(*else_value, f, Precedence::Ternary)?;
            if needs_paren {
                write!(f, ")")?;
            }
            Ok(())
        }
    })
}

fn expr_precedence(expr: Expr) -> Precedence {
    expr.with_node(|node| match node {
        ExprNode::Literal(_) | ExprNode::Ident(_) => Precedence::Postfix,
        ExprNode::Index { .. } | ExprNode::Call { .. } => Precedence::Postfix,
        ExprNode::Unary { .. } => Precedence::Prefix,
        ExprNode::Binary { op, .. } => op.precedence(),
        ExprNode::Piecewise { .. } => Precedence::Ternary,
    })
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::ident(value)
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::ident(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::lit_i64(i64::from(value))
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::lit_i64(value)
    }
}

impl From<usize> for Expr {
    fn from(value: usize) -> Self {
        let value = i64::try_from(value).expect("usize literal does not fit in i64");
        Expr::lit_i64(value)
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::lit_f64(value)
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Self::Output {
        Expr::binary(self, BinaryOp::Add, rhs)
    }
}

impl std::ops::Add<f64> for Expr {
    type Output = Expr;

    fn add(self, rhs: f64) -> Self::Output {
        self + Expr::from(rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Self::Output {
        Expr::binary(self, BinaryOp::Sub, rhs)
    }
}

impl std::ops::Sub<f64> for Expr {
    type Output = Expr;

    fn sub(self, rhs: f64) -> Self::Output {
        self - Expr::from(rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Self::Output {
        Expr::binary(self, BinaryOp::Mul, rhs)
    }
}

impl std::ops::Mul<f64> for Expr {
    type Output = Expr;

    fn mul(self, rhs: f64) -> Self::Output {
        self * Expr::from(rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Self::Output {
        Expr::binary(self, BinaryOp::Div, rhs)
    }
}

impl std::ops::Div<f64> for Expr {
    type Output = Expr;

    fn div(self, rhs: f64) -> Self::Output {
        self / Expr::from(rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Self::Output {
        Expr::unary(UnaryOp::Negate, self)
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Self::Output {
        Expr::unary(UnaryOp::Not, self)
    }
}

impl std::ops::BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Self::Output {
        Expr::binary(self, BinaryOp::And, rhs)
    }
}

impl std::ops::BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Self::Output {
        Expr::binary(self, BinaryOp::Or, rhs)
    }
}

pub(crate) struct RenderContext<'a> {
    output: &'a mut String,
    indent: usize,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(output: &'a mut String) -> Self {
        Self { output, indent: 0 }
    }

    fn indent(&mut self) {
        self.indent += 1;
    }

    fn dedent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.output.push_str("    ");
        }
        self.output.push_str(text);
        self.output.push('\n');
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CseConfig {
    pub min_occurrences: usize,
    pub min_nodes: usize,
    pub max_bindings: usize,
}

impl Default for CseConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 2,
            // Stencil symbols count as leaves; anything compound that repeats
            // is worth a temporary.
            min_nodes: 2,
            // Safety valve: keep temporary explosions under control.
            max_bindings: 64,
        }
    }
}

/// Common-subexpression elimination over a set of expression roots.
///
/// Returns a prelude of `double` declarations (ordered by dependency) and
/// rewritten roots that reference those temporaries.
///
/// Note: expressions are assumed to be side-effect free; subtrees shared
/// between a piecewise condition and its arms are hoisted above the branch.
pub struct CseBuilder {
    prefix: String,
    next_id: u32,
    config: CseConfig,
}

impl CseBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_config(prefix, CseConfig::default())
    }

    pub fn with_config(prefix: impl Into<String>, config: CseConfig) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: 0,
            config,
        }
    }

    pub fn eliminate(&mut self, roots: &[Expr]) -> (Vec<Stmt>, Vec<Expr>) {
        if roots.is_empty() {
            return (Vec::new(), Vec::new());
        }

        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        enum NodeKey {
            Literal(Literal),
            Ident(String),
            Index {
                base: Expr,
                index: Expr,
            },
            Unary {
                op: UnaryOp,
                expr: Expr,
            },
            Binary {
                left: Expr,
                op: BinaryOp,
                right: Expr,
            },
            Call {
                callee: Expr,
                args: Vec<Expr>,
            },
            Piecewise {
                cond: Expr,
                then_value: Expr,
                else_value: Expr,
            },
        }

        #[derive(Default)]
        struct Canonicalizer {
            memo: IndexMap<Expr, Expr>,
            intern: IndexMap<NodeKey, Expr>,
        }

        impl Canonicalizer {
            fn canon(&mut self, expr: Expr) -> Expr {
                if let Some(rep) = self.memo.get(&expr).copied() {
                    return rep;
                }

                let key = expr.with_node(|node| match node {
                    ExprNode::Literal(lit) => NodeKey::Literal(lit.clone()),
                    ExprNode::Ident(name) => NodeKey::Ident(name.clone()),
                    ExprNode::Index { base, index } => NodeKey::Index {
                        base: self.canon(*base),
                        index: self.canon(*index),
                    },
                    ExprNode::Unary { op, expr } => NodeKey::Unary {
                        op: *op,
                        expr: self.canon(*expr),
                    },
                    ExprNode::Binary { left, op, right } => NodeKey::Binary {
                        left: self.canon(*left),
                        op: *op,
                        right: self.canon(*right),
                    },
                    ExprNode::Call { callee, args } => NodeKey::Call {
                        callee: self.canon(*callee),
                        args: args.iter().copied().map(|arg| self.canon(arg)).collect(),
                    },
                    ExprNode::Piecewise {
                        cond,
                        then_value,
                        else_value,
                    } => NodeKey::Piecewise {
                        cond: self.canon(*cond),
                        then_value: self.canon(*then_value),
                        else_value: self.canon(*else_value),
                    },
                });

                let rep = *self.intern.entry(key).or_insert(expr);
                self.memo.insert(expr, rep);
                rep
            }
        }

        // Literals, plain identifiers, and `name[i]` stencil symbols are
        // already atomic reads; naming them buys nothing.
        fn expr_is_trivial(expr: Expr) -> bool {
            if expr.try_indexed_ident().is_some() {
                return true;
            }
            expr.with_node(|node| matches!(node, ExprNode::Literal(_) | ExprNode::Ident(_)))
        }

        fn expr_size(
            expr: Expr,
            canon: &mut Canonicalizer,
            memo: &mut IndexMap<Expr, usize>,
        ) -> usize {
            let rep = canon.canon(expr);
            if let Some(size) = memo.get(&rep).copied() {
                return size;
            }
            let size = rep.with_node(|node| match node {
                ExprNode::Literal(_) | ExprNode::Ident(_) => 1,
                ExprNode::Index { base, index } => {
                    1 + expr_size(*base, canon, memo) + expr_size(*index, canon, memo)
                }
                ExprNode::Unary { expr, .. } => 1 + expr_size(*expr, canon, memo),
                ExprNode::Binary { left, right, .. } => {
                    1 + expr_size(*left, canon, memo) + expr_size(*right, canon, memo)
                }
                ExprNode::Call { callee, args } => {
                    1 + expr_size(*callee, canon, memo)
                        + args
                            .iter()
                            .copied()
                            .map(|arg| expr_size(arg, canon, memo))
                            .sum::<usize>()
                }
                ExprNode::Piecewise {
                    cond,
                    then_value,
                    else_value,
                } => {
                    1 + expr_size(*cond, canon, memo)
                        + expr_size(*then_value, canon, memo)
                        + expr_size(*else_value, canon, memo)
                }
            });
            memo.insert(rep, size);
            size
        }

        fn count_subexprs(
            expr: Expr,
            canon: &mut Canonicalizer,
            counts: &mut IndexMap<Expr, usize>,
        ) {
            let rep = canon.canon(expr);
            *counts.entry(rep).or_insert(0) += 1;
            expr.with_node(|node| match node {
                ExprNode::Literal(_) | ExprNode::Ident(_) => {}
                ExprNode::Index { base, index } => {
                    count_subexprs(*base, canon, counts);
                    count_subexprs(*index, canon, counts);
                }
                ExprNode::Unary { expr, .. } => count_subexprs(*expr, canon, counts),
                ExprNode::Binary { left, right, .. } => {
                    count_subexprs(*left, canon, counts);
                    count_subexprs(*right, canon, counts);
                }
                ExprNode::Call { callee, args } => {
                    count_subexprs(*callee, canon, counts);
                    for arg in args {
                        count_subexprs(*arg, canon, counts);
                    }
                }
                ExprNode::Piecewise {
                    cond,
                    then_value,
                    else_value,
                } => {
                    count_subexprs(*cond, canon, counts);
                    count_subexprs(*then_value, canon, counts);
                    count_subexprs(*else_value, canon, counts);
                }
            });
        }

        let mut canon = Canonicalizer::default();
        let mut counts = IndexMap::<Expr, usize>::new();
        for root in roots {
            count_subexprs(*root, &mut canon, &mut counts);
        }

        let mut sizes = IndexMap::<Expr, usize>::new();
        let mut candidates = Vec::new();
        for (rep, count) in &counts {
            if *count < self.config.min_occurrences {
                continue;
            }
            if expr_is_trivial(*rep) {
                continue;
            }
            let size = expr_size(*rep, &mut canon, &mut sizes);
            if size < self.config.min_nodes {
                continue;
            }

            // Rough benefit: saves `(count - 1)` re-emissions of this subtree.
            let benefit = (count.saturating_sub(1)) * size;
            candidates.push((*rep, benefit));
        }

        // Sort by benefit descending, then by expr id ascending for determinism.
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0 .0.cmp(&b.0 .0)));
        candidates.truncate(self.config.max_bindings);

        let extract: IndexSet<Expr> = candidates.into_iter().map(|(rep, _)| rep).collect();

        struct Rewriter<'a> {
            canon: &'a mut Canonicalizer,
            extract: &'a IndexSet<Expr>,
            names: IndexMap<Expr, String>,
            stmts: Vec<Stmt>,
            prefix: &'a str,
            next_id: &'a mut u32,
        }

        impl<'a> Rewriter<'a> {
            fn rewrite(&mut self, expr: Expr) -> Expr {
                let rep = self.canon.canon(expr);
                if let Some(name) = self.names.get(&rep) {
                    return Expr::ident(name.clone());
                }

                if self.extract.contains(&rep) {
                    let name = format!("{}{}", self.prefix, *self.next_id);
                    *self.next_id = self.next_id.saturating_add(1);
                    self.names.insert(rep, name.clone());
                    let rhs = self.rebuild(rep);
                    self.stmts.push(Stmt::Decl {
                        name: name.clone(),
                        expr: rhs,
                    });
                    return Expr::ident(name);
                }

                self.rebuild(expr)
            }

            fn rebuild(&mut self, expr: Expr) -> Expr {
                // Important: avoid allocating new `Expr` nodes while holding a
                // borrow of the arena (which `with_node` uses internally).
                let node = expr.with_node(|node| node.clone());
                match node {
                    ExprNode::Literal(_) | ExprNode::Ident(_) => expr,
                    ExprNode::Index { base, index } => {
                        let new_base = self.rewrite(base);
                        let new_index = self.rewrite(index);
                        if new_base == base && new_index == index {
                            expr
                        } else {
                            new_base.index(new_index)
                        }
                    }
                    ExprNode::Unary { op, expr: inner } => {
                        let new_inner = self.rewrite(inner);
                        if new_inner == inner {
                            return expr;
                        }
                        match op {
                            UnaryOp::Negate => -new_inner,
                            UnaryOp::Not => !new_inner,
                        }
                    }
                    ExprNode::Binary { left, op, right } => {
                        let new_left = self.rewrite(left);
                        let new_right = self.rewrite(right);
                        if new_left == left && new_right == right {
                            return expr;
                        }
                        match op {
                            BinaryOp::Add => new_left + new_right,
                            BinaryOp::Sub => new_left - new_right,
                            BinaryOp::Mul => new_left * new_right,
                            BinaryOp::Div => new_left / new_right,
                            BinaryOp::Less => new_left.lt(new_right),
                            BinaryOp::LessEq => new_left.le(new_right),
                            BinaryOp::Greater => new_left.gt(new_right),
                            BinaryOp::GreaterEq => new_left.ge(new_right),
                            BinaryOp::Equal => new_left.eq(new_right),
                            BinaryOp::NotEqual => new_left.ne(new_right),
                            BinaryOp::And => new_left & new_right,
                            BinaryOp::Or => new_left | new_right,
                        }
                    }
                    ExprNode::Call { callee, args } => {
                        let new_callee = self.rewrite(callee);
                        let mut changed = new_callee != callee;
                        let new_args: Vec<Expr> = args
                            .into_iter()
                            .map(|arg| {
                                let new_arg = self.rewrite(arg);
                                if new_arg != arg {
                                    changed = true;
                                }
                                new_arg
                            })
                            .collect();
                        if !changed {
                            expr
                        } else {
                            Expr::call(new_callee, new_args)
                        }
                    }
                    ExprNode::Piecewise {
                        cond,
                        then_value,
                        else_value,
                    } => {
                        let new_cond = self.rewrite(cond);
                        let new_then = self.rewrite(then_value);
                        let new_else = self.rewrite(else_value);
                        if new_cond == cond && new_then == then_value && new_else == else_value {
                            expr
                        } else {
                            Expr::piecewise(new_cond, new_then, new_else)
                        }
                    }
                }
            }
        }

        let mut rw = Rewriter {
            canon: &mut canon,
            extract: &extract,
            names: IndexMap::new(),
            stmts: Vec::new(),
            prefix: &self.prefix,
            next_id: &mut self.next_id,
        };

        let new_roots = roots.iter().copied().map(|r| rw.rewrite(r)).collect();
        (rw.stmts, new_roots)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expr_builders_render_expected_c99() {
        let expr = Expr::ident("a") + Expr::ident("b") * Expr::ident("c");
        assert_eq!(expr.to_string(), "a + b * c");

        let expr = Expr::ident("Vi").index(0);
        assert_eq!(expr.to_string(), "Vi[0]");

        let expr = (Expr::ident("x") * Expr::ident("x")).sqrt();
        assert_eq!(expr.to_string(), "sqrt(x * x)");

        let expr: Expr = 1.0.into();
        assert_eq!(expr.to_string(), "1.0");

        let expr = Expr::lit_f64(1.0) - Expr::ident("toi");
        assert_eq!(expr.to_string(), "1.0 - toi");
    }

    #[test]
    fn expr_renders_non_associative_rhs_with_parentheses() {
        let a = Expr::ident("a");
        let b = Expr::ident("b");
        let c = Expr::ident("c");

        assert_eq!((a - (b - c)).to_string(), "a - (b - c)");
        assert_eq!((a / (b / c)).to_string(), "a / (b / c)");
        assert_eq!((a / (b * c)).to_string(), "a / (b * c)");
    }

    #[test]
    fn expr_renders_comparisons_and_disjunctions() {
        let p = Expr::ident("p");
        let eps = Expr::ident("epsilon");
        let expr = eps.gt(0.0) | p.gt(0.0) | (-p).gt(0.0);
        assert_eq!(expr.to_string(), "epsilon > 0.0 || p > 0.0 || -p > 0.0");
    }

    #[test]
    fn piecewise_renders_as_ternary_in_expression_position() {
        let v = Expr::ident("v");
        let expr = Expr::piecewise(v.gt(0.0), -v, v);
        assert_eq!(expr.to_string(), "v > 0.0 ? -v : v");

        let nested = Expr::ident("k") * Expr::piecewise(v.gt(0.0), -v, v);
        assert_eq!(nested.to_string(), "k * (v > 0.0 ? -v : v)");
    }

    #[test]
    fn piecewise_assignment_renders_as_if_else() {
        let v = Expr::ident("v");
        let stmt = Stmt::Assign {
            name: "volume".to_string(),
            expr: Expr::piecewise(v.gt(0.0), -v, v),
        };
        let text = render_stmts(&[stmt]);
        assert_eq!(
            text,
            "if (v > 0.0) {\n    volume = -v;\n} else {\n    volume = v;\n}\n"
        );
    }

    #[test]
    fn cse_extracts_repeated_subtrees_once() {
        let a = Expr::ident("a");
        let b = Expr::ident("b");
        let shared = (a + b) * (a + b);
        let roots = [shared + a, shared * b];

        let mut builder = CseBuilder::new("x");
        let (stmts, new_roots) = builder.eliminate(&roots);

        assert_eq!(new_roots.len(), 2);
        let text = render_stmts(&stmts);
        // One temp for `a + b`, one for its square. Names are allocated on
        // first encounter (outermost first) but emitted dependency-first.
        assert_eq!(text, "double x1 = a + b;\ndouble x0 = x1 * x1;\n");
        assert_eq!(new_roots[0].to_string(), "x0 + a");
        assert_eq!(new_roots[1].to_string(), "x0 * b");
    }

    #[test]
    fn cse_leaves_stencil_symbols_inline() {
        let vi0 = Expr::ident("Vi").index(0);
        let roots = [vi0 + Expr::ident("a"), vi0 * Expr::ident("b")];

        let mut builder = CseBuilder::new("x");
        let (stmts, new_roots) = builder.eliminate(&roots);

        assert!(stmts.is_empty());
        assert_eq!(new_roots[0].to_string(), "Vi[0] + a");
        assert_eq!(new_roots[1].to_string(), "Vi[0] * b");
    }

    #[test]
    fn cse_hoists_subtrees_shared_across_piecewise_arms() {
        let a = Expr::ident("a");
        let b = Expr::ident("b");
        let raw = (a * a + b * b).sqrt();
        let root = Expr::piecewise(raw.gt(0.0), -raw, raw);

        let mut builder = CseBuilder::new("x");
        let (stmts, new_roots) = builder.eliminate(&[root]);

        let text = render_stmts(&stmts);
        assert!(text.contains("sqrt"), "{text}");
        let (cond, then_value, else_value) =
            new_roots[0].try_piecewise().expect("piecewise preserved");
        // All three positions reference the same hoisted temporary.
        assert_eq!(else_value.to_string(), cond.to_string().replace(" > 0.0", ""));
        assert_eq!(then_value.to_string(), format!("-{}", else_value));
    }

    #[test]
    fn rewrite_indexed_idents_replaces_matching_symbols_only() {
        let expr = Expr::ident("Ui").index(0) + Expr::ident("Vi").index(0) * Expr::ident("toi");
        let rewritten = expr.rewrite_indexed_idents(&mut |name, index| {
            (name == "Ui" && index == 0).then(|| "Uix".to_string())
        });
        assert_eq!(rewritten.to_string(), "Uix + Vi[0] * toi");
        // Untouched trees come back as-is.
        let unchanged = expr.rewrite_indexed_idents(&mut |_, _| None);
        assert_eq!(unchanged, expr);
    }
}
