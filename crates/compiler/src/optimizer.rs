//! Constant folding
//!
//! A pure AST-to-AST pass invoked by the compiler on each expression
//! before emission. It folds infix operators over two numeric
//! literals (bools count as numbers), `+` over two string literals,
//! and prefix `-`/`!` over a literal. A folded node inherits the
//! position of the expression it replaces.
//!
//! Returns `None` when nothing folded; the caller keeps the original.
//! Partial folds inside a non-foldable parent are not returned here:
//! the compiler revisits every child expression on descent, so inner
//! literals still fold where they stand.

use crate::ast::{Expr, ExprKind, Operator};

pub fn optimize(expr: &Expr) -> Option<Expr> {
    match &expr.kind {
        ExprKind::Infix { op, left, right } => optimize_infix(expr, *op, left, right),
        ExprKind::Prefix { op, right } => optimize_prefix(expr, *op, right),
        _ => None,
    }
}

/// Literal numeric view of an expression, with bools as 0/1.
fn numeric_lit(expr: &Expr) -> Option<f64> {
    match expr.kind {
        ExprKind::NumberLit(n) => Some(n),
        ExprKind::BoolLit(b) => Some(if b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn optimize_infix(expr: &Expr, op: Operator, left: &Expr, right: &Expr) -> Option<Expr> {
    let folded_left = optimize(left);
    let folded_right = optimize(right);
    let left = folded_left.as_ref().unwrap_or(left);
    let right = folded_right.as_ref().unwrap_or(right);

    if let (Some(l), Some(r)) = (numeric_lit(left), numeric_lit(right)) {
        let kind = match op {
            Operator::Plus => ExprKind::NumberLit(l + r),
            Operator::Minus => ExprKind::NumberLit(l - r),
            Operator::Asterisk => ExprKind::NumberLit(l * r),
            Operator::Slash => ExprKind::NumberLit(l / r),
            Operator::Modulus => ExprKind::NumberLit(l % r),
            Operator::Lt => ExprKind::BoolLit(l < r),
            Operator::Lte => ExprKind::BoolLit(l <= r),
            Operator::Gt => ExprKind::BoolLit(l > r),
            Operator::Gte => ExprKind::BoolLit(l >= r),
            Operator::Eq => ExprKind::BoolLit(l == r),
            Operator::NotEq => ExprKind::BoolLit(l != r),
            Operator::BitAnd => ExprKind::NumberLit(((l as i64) & (r as i64)) as f64),
            Operator::BitOr => ExprKind::NumberLit(((l as i64) | (r as i64)) as f64),
            Operator::BitXor => ExprKind::NumberLit(((l as i64) ^ (r as i64)) as f64),
            Operator::Lshift => ExprKind::NumberLit(((l as i64) << ((r as i64) & 63)) as f64),
            Operator::Rshift => ExprKind::NumberLit(((l as i64) >> ((r as i64) & 63)) as f64),
            _ => return None,
        };
        return Some(Expr::new(kind, expr.pos.clone()));
    }

    if op == Operator::Plus {
        if let (ExprKind::StringLit(l), ExprKind::StringLit(r)) = (&left.kind, &right.kind) {
            let mut s = String::with_capacity(l.len() + r.len());
            s.push_str(l);
            s.push_str(r);
            return Some(Expr::new(ExprKind::StringLit(s), expr.pos.clone()));
        }
    }

    None
}

fn optimize_prefix(expr: &Expr, op: Operator, right: &Expr) -> Option<Expr> {
    let folded = optimize(right);
    let right = folded.as_ref().unwrap_or(right);
    match (op, &right.kind) {
        (Operator::Minus, ExprKind::NumberLit(n)) => {
            Some(Expr::new(ExprKind::NumberLit(-n), expr.pos.clone()))
        }
        (Operator::Bang, ExprKind::BoolLit(b)) => {
            Some(Expr::new(ExprKind::BoolLit(!b), expr.pos.clone()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brio_core::Pos;

    fn num(n: f64) -> Expr {
        Expr::new(ExprKind::NumberLit(n), Pos::invalid())
    }

    fn infix(op: Operator, l: Expr, r: Expr) -> Expr {
        Expr::new(
            ExprKind::Infix {
                op,
                left: Box::new(l),
                right: Box::new(r),
            },
            Pos::invalid(),
        )
    }

    fn folded_number(expr: &Expr) -> Option<f64> {
        match optimize(expr)?.kind {
            ExprKind::NumberLit(n) => Some(n),
            _ => None,
        }
    }

    #[test]
    fn test_arithmetic_folds() {
        assert_eq!(
            folded_number(&infix(Operator::Plus, num(1.0), num(2.0))),
            Some(3.0)
        );
        assert_eq!(
            folded_number(&infix(Operator::Modulus, num(7.0), num(4.0))),
            Some(3.0)
        );
        assert_eq!(
            folded_number(&infix(Operator::Lshift, num(1.0), num(4.0))),
            Some(16.0)
        );
    }

    #[test]
    fn test_nested_fold() {
        // 1 + 2 * 3 parses as 1 + (2 * 3) and folds to 7.
        let expr = infix(
            Operator::Plus,
            num(1.0),
            infix(Operator::Asterisk, num(2.0), num(3.0)),
        );
        assert_eq!(folded_number(&expr), Some(7.0));
    }

    #[test]
    fn test_bool_as_number() {
        let expr = infix(
            Operator::Plus,
            Expr::new(ExprKind::BoolLit(true), Pos::invalid()),
            num(2.0),
        );
        assert_eq!(folded_number(&expr), Some(3.0));
    }

    #[test]
    fn test_comparison_folds_to_bool() {
        let expr = infix(Operator::Lt, num(1.0), num(2.0));
        assert!(matches!(
            optimize(&expr).map(|e| e.kind),
            Some(ExprKind::BoolLit(true))
        ));
    }

    #[test]
    fn test_string_concat() {
        let expr = infix(
            Operator::Plus,
            Expr::new(ExprKind::StringLit("foo".into()), Pos::invalid()),
            Expr::new(ExprKind::StringLit("bar".into()), Pos::invalid()),
        );
        assert!(matches!(
            optimize(&expr).map(|e| e.kind),
            Some(ExprKind::StringLit(s)) if s == "foobar"
        ));
    }

    #[test]
    fn test_prefix_folds() {
        let neg = Expr::new(
            ExprKind::Prefix {
                op: Operator::Minus,
                right: Box::new(num(5.0)),
            },
            Pos::invalid(),
        );
        assert!(matches!(
            optimize(&neg).map(|e| e.kind),
            Some(ExprKind::NumberLit(n)) if n == -5.0
        ));
    }

    #[test]
    fn test_no_fold_with_ident() {
        let expr = infix(
            Operator::Plus,
            Expr::new(
                ExprKind::Ident(crate::ast::Ident {
                    name: "x".into(),
                    pos: Pos::invalid(),
                }),
                Pos::invalid(),
            ),
            num(1.0),
        );
        assert!(optimize(&expr).is_none());
    }
}
