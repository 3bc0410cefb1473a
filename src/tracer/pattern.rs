//! This module contains the arithmetic pattern matchers the tracer applies
//! to the symbolic expression a handler stores back to the virtual stack.
//!
//! The 8-bit handler variants slice their operands out of 16-bit stack
//! slots, which wraps the interesting operation in an extract over a
//! concatenation. Each matcher peels that wrapper the same way before
//! looking at the operation itself.

use crate::emu::ast::{is_variable, BinOp, Expr, UnaryOp};

/// The alias the virtual-stack fetch variables are minted under.
const VSP_FETCH: &str = "[vsp]";

/// Peels the 8-bit slicing wrapper: an extract over a concatenation matches
/// on the low part of the concatenation.
fn through_slicing(expr: &Expr) -> Option<&Expr> {
    if let Expr::Extract { operand, .. } = expr {
        if let Expr::Concat { lo, .. } = &**operand {
            return Some(lo);
        }
    }
    None
}

/// Matches `_ + [vsp]`.
#[must_use]
pub fn match_add(expr: &Expr) -> bool {
    if let Some(inner) = through_slicing(expr) {
        return match_add(inner);
    }
    matches!(expr, Expr::Binary { op: BinOp::Add, rhs, .. } if is_variable(rhs, VSP_FETCH))
}

/// Matches `~_ | ~[vsp]`.
///
/// For the 8-bit variant the expression is an extract over a concatenation
/// whose low part carries the disjunction.
#[must_use]
pub fn match_nand(expr: &Expr) -> bool {
    if let Some(inner) = through_slicing(expr) {
        return match_nand(inner);
    }
    match expr {
        Expr::Binary {
            op: BinOp::Or,
            rhs,
            ..
        } => {
            matches!(&**rhs, Expr::Unary { op: UnaryOp::Not, operand } if is_variable(operand, VSP_FETCH))
        }
        _ => false,
    }
}

/// Matches `~_ & ~[vsp]`.
#[must_use]
pub fn match_nor(expr: &Expr) -> bool {
    if let Some(inner) = through_slicing(expr) {
        return match_nor(inner);
    }
    match expr {
        Expr::Binary {
            op: BinOp::And,
            rhs,
            ..
        } => {
            matches!(&**rhs, Expr::Unary { op: UnaryOp::Not, operand } if is_variable(operand, VSP_FETCH))
        }
        _ => false,
    }
}

/// Matches `[vsp] >> (_ & mask)`.
#[must_use]
pub fn match_shr(expr: &Expr) -> bool {
    if let Expr::Extract { operand, .. } = expr {
        if let Expr::Concat { lo, .. } = &**operand {
            return matches!(&**lo, Expr::Binary { op: BinOp::Lshr, .. });
        }
    }
    match expr {
        Expr::Binary {
            op: BinOp::Lshr,
            lhs,
            rhs,
        } => {
            matches!(&**rhs, Expr::Binary { op: BinOp::And, .. }) && is_variable(lhs, VSP_FETCH)
        }
        _ => false,
    }
}

/// Matches `[vsp] << (_ & mask)`.
#[must_use]
pub fn match_shl(expr: &Expr) -> bool {
    if let Expr::Extract { operand, .. } = expr {
        if let Expr::Concat { lo, .. } = &**operand {
            return matches!(&**lo, Expr::Binary { op: BinOp::Shl, .. });
        }
    }
    match expr {
        Expr::Binary {
            op: BinOp::Shl,
            lhs,
            rhs,
        } => {
            matches!(&**rhs, Expr::Binary { op: BinOp::And, .. }) && is_variable(lhs, VSP_FETCH)
        }
        _ => false,
    }
}

/// Matches the double-precision right shift: an extract over a rotate-right
/// of the packed operands.
#[must_use]
pub fn match_shrd(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Extract { operand, .. } if matches!(&**operand, Expr::Binary { op: BinOp::Ror, .. })
    )
}

/// Matches the double-precision left shift: an extract over a rotate-left of
/// the packed operands.
#[must_use]
pub fn match_shld(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Extract { operand, .. } if matches!(&**operand, Expr::Binary { op: BinOp::Rol, .. })
    )
}
