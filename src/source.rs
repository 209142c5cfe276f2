//! Kernel source loading.
//!
//! Relative paths are resolved against the working directory first and then
//! against the crate root, so the harness finds its bundled kernels no matter
//! where it is launched from.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BenchError, Result};

/// Reference kernel shipped with the crate, relative to the crate root.
pub const DEFAULT_KERNEL_PATH: &str = "src/cl/aplusb.cl";

/// Non-empty kernel source text.
#[derive(Debug, Clone)]
pub struct KernelSource {
    origin: String,
    text: String,
}

impl KernelSource {
    /// Read a kernel from disk. A missing, unreadable or blank file is
    /// `EmptySource`.
    pub fn load(path: &Path) -> Result<Self> {
        let resolved = resolve(path).ok_or_else(|| BenchError::EmptySource {
            path: path.display().to_string(),
        })?;
        let text = std::fs::read_to_string(&resolved).map_err(|e| {
            debug!(path = %resolved.display(), error = %e, "kernel source unreadable");
            BenchError::EmptySource {
                path: resolved.display().to_string(),
            }
        })?;
        let source = Self::from_text(&resolved.display().to_string(), text)?;
        debug!(path = %source.origin, bytes = source.text.len(), "loaded kernel source");
        Ok(source)
    }

    /// Wrap in-memory source text; `origin` names it in diagnostics.
    pub fn from_text(origin: &str, text: String) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(BenchError::EmptySource {
                path: origin.to_string(),
            });
        }
        Ok(Self {
            origin: origin.to_string(),
            text,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

fn resolve(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if path.is_relative() {
        let relocated = Path::new(env!("CARGO_MANIFEST_DIR")).join(path);
        if relocated.is_file() {
            debug!(path = %relocated.display(), "kernel source resolved against crate root");
            return Some(relocated);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_is_empty_source() {
        let err = KernelSource::load(Path::new("does/not/exist.cl")).unwrap_err();
        assert!(matches!(err, BenchError::EmptySource { .. }));
    }

    #[test]
    fn test_blank_file_is_empty_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "   \n\t").unwrap();
        let err = KernelSource::load(file.path()).unwrap_err();
        assert!(matches!(err, BenchError::EmptySource { .. }));
    }

    #[test]
    fn test_bundled_kernel_resolves_from_any_directory() {
        let source = KernelSource::load(Path::new(DEFAULT_KERNEL_PATH)).unwrap();
        assert!(source.text().contains("aplusb"));
    }
}
