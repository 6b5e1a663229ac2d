pub mod c_ast;
pub mod lower;
pub mod rename;
pub mod symbols;
pub mod template;
pub mod volume;

pub use c_ast::{CseBuilder, CseConfig, Expr, Stmt};
pub use lower::{lower, LowerError, LoweredCodeBody, GENERATED_NOTICE};
pub use rename::rename_velocity_components;
pub use symbols::{vec2_symbols, Vec2Sym};
pub use template::render_source;
pub use volume::{volume_formula, GuardedExpr};

/// The two emitted code bodies for one generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCode {
    /// Value flavor: velocities read as `U<letter>[0]` / `U<letter>[1]`.
    pub value_code: String,
    /// Gradient flavor: velocities read as `U<letter>x` / `U<letter>y`.
    pub gradient_code: String,
}

/// Derive the collision-volume code bodies for the fixed 4-point stencil.
///
/// Symbols are created fresh per call; runs are independent and the output
/// is deterministic.
pub fn derive_volume_code() -> Result<VolumeCode, LowerError> {
    let v = vec2_symbols('V');
    let u = vec2_symbols('U');

    let body = lower(&volume_formula(&v, &u))?;
    let gradient = rename_velocity_components(&body);

    Ok(VolumeCode {
        value_code: body.to_c99(),
        gradient_code: gradient.to_c99(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_volume_code_is_deterministic() {
        let first = derive_volume_code().expect("derivation succeeds");
        let second = derive_volume_code().expect("derivation succeeds");
        assert_eq!(first, second);
    }

    #[test]
    fn value_and_gradient_bodies_share_everything_but_velocity_names() {
        let code = derive_volume_code().expect("derivation succeeds");
        let mut renamed = code.value_code.clone();
        for letter in ['i', 'j', 'k', 'l'] {
            renamed = renamed
                .replace(&format!("U{letter}[0]"), &format!("U{letter}x"))
                .replace(&format!("U{letter}[1]"), &format!("U{letter}y"));
        }
        assert_eq!(renamed, code.gradient_code);
    }
}
