//! The per-user qsub defaults file.

use crate::error::{Error, Result};
use crate::job_name::RUNTIME_RESOURCE;
use crate::options::JobOptions;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the defaults file inside the home directory.
pub const DEFAULTS_FILE_NAME: &str = ".run_jupyter.qsub_option_defaults";

/// Runtime limit used when neither the command line nor the defaults file sets one.
pub const DEFAULT_RUNTIME: &str = "h_rt=9:0:0";

const HEADER: &str = "\
# Default qsub options for run-jupyter / qsub-jupyter.
#
# One qsub option per line, e.g.
#   -l mem_free=4G
#   -q interactive.q
#   -l h_rt=12:0:0
# Lines starting with '#' are ignored. Options given on the command line
# override the ones in this file. Options set here do not become part of
# the job name.
";

/// Location of the defaults file for a home directory.
pub fn default_path(home: &Path) -> PathBuf {
    home.join(DEFAULTS_FILE_NAME)
}

/// Contents of a defaults file, read once.
#[derive(Debug, Clone)]
pub struct DefaultsFile {
    pub path: PathBuf,
    text: String,
}

impl DefaultsFile {
    /// Load the file named by `-@`. It has to exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::usage(format!(
                "defaults file {} does not exist",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read defaults file {}", path.display()))?;
        Ok(Self::from_text(path, text))
    }

    /// Load the default file, creating it with a commented header first if
    /// it is missing.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            fs::write(path, HEADER)
                .with_context(|| format!("Failed to create defaults file {}", path.display()))?;
            tracing::info!(path = %path.display(), "created defaults file");
        }
        Self::load(path)
    }

    pub fn from_text(path: &Path, text: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            text: text.into(),
        }
    }

    /// Lines that carry an option: not blank and not commented out.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
    }

    /// Whether some uncommented line requests a runtime limit.
    pub fn sets_runtime_limit(&self) -> bool {
        self.entries().any(|line| {
            let line = line.split('#').next().unwrap_or("");
            line.contains(&format!("{RUNTIME_RESOURCE}="))
        })
    }
}

/// Whether a comma-joined `-l` value includes a runtime limit.
pub fn has_runtime_limit(resources: &str) -> bool {
    resources
        .split(',')
        .any(|entry| entry.trim_start().starts_with(&format!("{RUNTIME_RESOURCE}=")))
}

/// Add the default runtime limit to `options` unless one is already present
/// on the command line or in the defaults file.
///
/// Returns true when the default was added.
pub fn apply_runtime_default(options: &mut JobOptions, defaults: Option<&DefaultsFile>) -> bool {
    let on_cli = options.get("-l").is_some_and(has_runtime_limit);
    let in_file = defaults.is_some_and(DefaultsFile::sets_runtime_limit);
    if on_cli || in_file {
        return false;
    }
    options.append_list("-l", DEFAULT_RUNTIME);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn defaults(text: &str) -> DefaultsFile {
        DefaultsFile::from_text(Path::new("/tmp/defaults"), text)
    }

    #[test]
    fn test_load_or_create_writes_header() {
        let dir = TempDir::new().unwrap();
        let path = default_path(dir.path());
        let file = DefaultsFile::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(file.entries().count(), 0);
        assert!(fs::read_to_string(&path).unwrap().starts_with('#'));
    }

    #[test]
    fn test_load_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = default_path(dir.path());
        fs::write(&path, "-l mem_free=8G\n").unwrap();
        let file = DefaultsFile::load_or_create(&path).unwrap();
        assert_eq!(file.entries().collect::<Vec<_>>(), vec!["-l mem_free=8G"]);
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = TempDir::new().unwrap();
        let err = DefaultsFile::load(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_sets_runtime_limit_ignores_comments() {
        assert!(!defaults("# -l h_rt=1:0:0\n-l mem_free=4G\n").sets_runtime_limit());
        assert!(!defaults("-l mem_free=4G # h_rt=1:0:0\n").sets_runtime_limit());
        assert!(defaults("  -l h_rt=24:0:0\n").sets_runtime_limit());
        assert!(defaults("-l mem_free=4G,h_rt=2:0:0\n").sets_runtime_limit());
    }

    #[test]
    fn test_default_runtime_added_when_absent() {
        let mut options = JobOptions::new();
        options.set("-l", "mem_free=4G");
        assert!(apply_runtime_default(&mut options, Some(&defaults("-q all.q\n"))));
        assert_eq!(options.get("-l"), Some("mem_free=4G,h_rt=9:0:0"));

        let mut empty = JobOptions::new();
        assert!(apply_runtime_default(&mut empty, None));
        assert_eq!(empty.get("-l"), Some("h_rt=9:0:0"));
    }

    #[test]
    fn test_explicit_runtime_preserved() {
        let mut options = JobOptions::new();
        options.set("-l", "h_rt=2:30:0");
        assert!(!apply_runtime_default(&mut options, None));
        assert_eq!(options.get("-l"), Some("h_rt=2:30:0"));
    }

    #[test]
    fn test_runtime_from_file_suppresses_default() {
        let mut options = JobOptions::new();
        assert!(!apply_runtime_default(
            &mut options,
            Some(&defaults("-l h_rt=48:0:0\n"))
        ));
        assert!(!options.contains("-l"));
    }
}
