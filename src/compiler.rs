use std::fs;
use std::path::{Path, PathBuf};

pub fn generated_dir_for(base_dir: impl AsRef<Path>) -> PathBuf {
    base_dir.as_ref().join("generated")
}

pub fn write_file_if_changed(
    output_path: impl AsRef<Path>,
    content: &str,
) -> std::io::Result<PathBuf> {
    let output_path = output_path.as_ref();
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Ok(existing) = fs::read_to_string(output_path) {
        if existing == content {
            return Ok(output_path.to_path_buf());
        }
    }
    fs::write(output_path, content)?;
    Ok(output_path.to_path_buf())
}

/// Derive the collision-volume source and write it under `generated/`.
pub fn emit_collision_volume_source(base_dir: impl AsRef<Path>) -> Result<PathBuf, EmitError> {
    let code = crate::codegen::derive_volume_code()?;
    let source = crate::codegen::render_source(&code);
    let output_path = generated_dir_for(base_dir).join("auto_collision_volume.cpp");
    Ok(write_file_if_changed(output_path, &source)?)
}

#[derive(Debug)]
pub enum EmitError {
    Lower(crate::codegen::LowerError),
    Io(std::io::Error),
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::Lower(err) => write!(f, "lowering failed: {err}"),
            EmitError::Io(err) => write!(f, "writing generated source failed: {err}"),
        }
    }
}

impl std::error::Error for EmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmitError::Lower(err) => Some(err),
            EmitError::Io(err) => Some(err),
        }
    }
}

impl From<crate::codegen::LowerError> for EmitError {
    fn from(err: crate::codegen::LowerError) -> Self {
        EmitError::Lower(err)
    }
}

impl From<std::io::Error> for EmitError {
    fn from(err: std::io::Error) -> Self {
        EmitError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_if_changed_is_idempotent() {
        let dir = std::env::temp_dir().join("ccd_codegen_write_test");
        let path = dir.join("out.cpp");
        let _ = fs::remove_file(&path);

        let written = write_file_if_changed(&path, "content").expect("first write");
        assert_eq!(fs::read_to_string(&written).unwrap(), "content");

        // Unchanged content must not rewrite the file.
        let before = fs::metadata(&path).unwrap().modified().unwrap();
        write_file_if_changed(&path, "content").expect("second write");
        let after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);

        write_file_if_changed(&path, "changed").expect("third write");
        assert_eq!(fs::read_to_string(&path).unwrap(), "changed");

        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir(&dir);
    }
}
