//! Edge-edge continuous-collision volume formula.
//!
//! The volume functional measures the signed swept region between the two
//! endpoints of edge (i, j) up to the time of impact. It is emitted as code,
//! never evaluated here: everything below stays symbolic.

use super::c_ast::Expr;
use super::symbols::Vec2Sym;

/// One entry of the derivation output: an unnamed entry is an assertion the
/// consumer must emit as a runtime check, the named entry is the returned
/// value.
#[derive(Debug, Clone, Copy)]
pub struct GuardedExpr {
    pub name: Option<&'static str>,
    pub expr: Expr,
}

impl GuardedExpr {
    pub fn assertion(expr: Expr) -> Self {
        Self { name: None, expr }
    }

    pub fn named(name: &'static str, expr: Expr) -> Self {
        Self {
            name: Some(name),
            expr,
        }
    }
}

/// Build the guarded expression sequence for the volume of edge (i, j).
///
/// `v` and `u` are the stencil position and velocity vectors for points
/// i, j, k, l; only i and j enter this formula, k and l belong to the
/// opposing edge of the pair and are consumed by the caller's other formulas.
///
/// Output order is fixed: [edge-length assertion, regularization assertion,
/// "volume"].
pub fn volume_formula(v: &[Vec2Sym; 4], u: &[Vec2Sym; 4]) -> Vec<GuardedExpr> {
    let (i, j) = (0, 1);

    let toi = Expr::ident("toi");
    let alpha = Expr::ident("alpha");
    let epsilon = Expr::ident("epsilon");

    // Edge at the time of impact.
    let e_toi = v[j].add(u[j].scale(toi)).sub(v[i].add(u[i].scale(toi)));
    let e_rot90_toi = e_toi.rot90();
    let e_length_toi = e_rot90_toi.norm();

    // Velocity of the contact point, interpolated along the edge.
    let u_ij = u[i].add(u[j].sub(u[i]).scale(alpha));

    let u_ij_dot_e_rot90_toi = u_ij.dot(e_rot90_toi);

    let volume = (Expr::lit_f64(1.0) - toi)
        * (epsilon * epsilon * (e_length_toi * e_length_toi)
            + u_ij_dot_e_rot90_toi * u_ij_dot_e_rot90_toi)
            .sqrt();
    // The algebraic form above is a norm and never negative; the branch is
    // what injects the sign convention, and its else arm only fires for the
    // degenerate coincident-edge case. It must survive into the emitted code
    // as a runtime conditional.
    let volume = Expr::piecewise(volume.gt(0.0), -volume, volume);

    vec![
        GuardedExpr::assertion(e_length_toi.gt(0.0)),
        GuardedExpr::assertion(
            epsilon.gt(0.0) | (u_ij_dot_e_rot90_toi.gt(0.0) | (-u_ij_dot_e_rot90_toi).gt(0.0)),
        ),
        GuardedExpr::named("volume", volume),
    ]
}
