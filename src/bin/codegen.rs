use ccd_codegen::compiler::emit_collision_volume_source;

fn main() {
    let base_dir = env!("CARGO_MANIFEST_DIR");
    match emit_collision_volume_source(base_dir) {
        Ok(path) => {
            println!("Wrote {}", path.display());
        }
        Err(err) => {
            eprintln!("Codegen failed: {}", err);
            std::process::exit(1);
        }
    }
}
