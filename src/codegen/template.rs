//! Assembly of the final generated source file.
//!
//! The code bodies reference free variables only; this step wraps them in
//! function definitions whose parameter lists supply those variables, in the
//! naming convention of each flavor. The output is complete C++ ready to be
//! dropped into the consuming engine's build.

use super::VolumeCode;

const HEADER: &str = "\
// Automatically generated source. Regenerate with `cargo run --bin codegen`.
#include <cassert>
#include <cmath>
";

fn indent_body(body: &str, levels: usize) -> String {
    let pad = "    ".repeat(levels);
    let mut out = String::new();
    for line in body.lines() {
        if line.is_empty() {
            out.push('\n');
            continue;
        }
        out.push_str(&pad);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Render the full `auto_collision_volume` translation unit.
pub fn render_source(code: &VolumeCode) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push_str("\nnamespace ccd {\nnamespace autogen {\n\n");

    out.push_str(
        "void collision_volume(\n    \
         const double Vi[2], const double Vj[2],\n    \
         const double Ui[2], const double Uj[2],\n    \
         double toi, double alpha, double epsilon,\n    \
         double& volume)\n{\n",
    );
    out.push_str(&indent_body(&code.value_code, 1));
    out.push_str("}\n\n");

    out.push_str(
        "void collision_volume_grad(\n    \
         const double Vi[2], const double Vj[2],\n    \
         double Uix, double Uiy, double Ujx, double Ujy,\n    \
         double toi, double alpha, double epsilon,\n    \
         double& volume)\n{\n",
    );
    out.push_str(&indent_body(&code.gradient_code, 1));
    out.push_str("}\n\n} // namespace autogen\n} // namespace ccd\n");

    out
}

#[cfg(test)]
mod tests {
    use super::super::derive_volume_code;
    use super::*;

    #[test]
    fn rendered_source_wraps_both_flavors() {
        let code = derive_volume_code().expect("derivation succeeds");
        let source = render_source(&code);

        assert!(source.starts_with("// Automatically generated"));
        assert!(source.contains("void collision_volume("), "{source}");
        assert!(source.contains("void collision_volume_grad("), "{source}");
        // Each body appears exactly once, indented into its function.
        let first_line = code.value_code.lines().next().unwrap();
        assert_eq!(source.matches(first_line.trim()).count(), 2, "{source}");
        assert!(source.contains("const double Ui[2]"), "{source}");
        assert!(source.contains("double Uix"), "{source}");
    }

    #[test]
    fn rendered_source_is_balanced() {
        let code = derive_volume_code().expect("derivation succeeds");
        let source = render_source(&code);
        assert_eq!(
            source.matches('{').count(),
            source.matches('}').count(),
            "{source}"
        );
    }
}
