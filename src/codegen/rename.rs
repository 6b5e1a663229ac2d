//! Gradient-flavored renaming of velocity components.
//!
//! The gradient code path receives the four stencil velocities as separate
//! scalars (`Uix`, `Uiy`, ..., `Ulx`, `Uly`) instead of `double[2]`
//! parameters. This pass derives that body from the value body by renaming
//! the `U<letter>[0]` / `U<letter>[1]` symbol leaves at the AST level, which
//! rules out accidental substring matches against temporaries or positions.

use super::lower::LoweredCodeBody;
use super::symbols::POINT_LETTERS;

fn velocity_component_name(name: &str, index: i64) -> Option<String> {
    let mut chars = name.chars();
    if chars.next() != Some('U') {
        return None;
    }
    let letter = chars.next()?;
    if chars.next().is_some() || !POINT_LETTERS.contains(&letter) {
        return None;
    }
    let suffix = match index {
        0 => 'x',
        1 => 'y',
        _ => return None,
    };
    Some(format!("U{letter}{suffix}"))
}

/// Derive the renamed body; the input body is left untouched. A body with no
/// velocity-component references comes back textually identical.
pub fn rename_velocity_components(body: &LoweredCodeBody) -> LoweredCodeBody {
    let stmts = body
        .stmts()
        .iter()
        .map(|stmt| {
            stmt.map_exprs(&mut |expr| {
                expr.rewrite_indexed_idents(&mut velocity_component_name)
            })
        })
        .collect();
    LoweredCodeBody::new(stmts)
}
