//! Script name -> command line.
//!
//! A script named `foo` lives at `<scripts_dir>/foo/main.<ext>`; the
//! extension picks the runtime program from the configured runtime table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::{ShellConfig, DEFAULT_RUNTIMES};
use crate::error::{Result, ShellError};

const ENTRY_STEM: &str = "main";

/// A resolved script: which program runs which entry file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub entry: PathBuf,
}

impl LaunchPlan {
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.arg(&self.entry);
        if let Some(dir) = self.entry.parent() {
            command.current_dir(dir);
        }
        command
    }
}

#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    scripts_dir: PathBuf,
    runtimes: HashMap<String, String>,
}

impl ScriptLauncher {
    pub fn new(scripts_dir: impl Into<PathBuf>, runtimes: HashMap<String, String>) -> Self {
        ScriptLauncher {
            scripts_dir: scripts_dir.into(),
            runtimes,
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self::new(config.scripts_dir(), config.runtime_table())
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Find the entry file and runtime for `name`.
    ///
    /// Built-in extensions are tried in their table order, then any extra
    /// user-configured ones alphabetically, so resolution is deterministic
    /// when a directory holds more than one `main.*`.
    pub fn resolve(&self, name: &str) -> Result<LaunchPlan> {
        if name.is_empty() || name.contains("..") {
            return Err(ShellError::ScriptNotFound(name.to_string()));
        }
        let dir = self.scripts_dir.join(name);

        for ext in self.lookup_order() {
            let entry = dir.join(format!("{}.{}", ENTRY_STEM, ext));
            if !entry.is_file() {
                continue;
            }
            let Some(program) = self.runtimes.get(&ext) else {
                continue;
            };
            let program = which::which(program).unwrap_or_else(|_| PathBuf::from(program));
            debug!(script = %name, entry = %entry.display(), program = %program.display(), "Resolved script");
            return Ok(LaunchPlan { program, entry });
        }

        Err(ShellError::ScriptNotFound(name.to_string()))
    }

    pub fn command(&self, name: &str) -> Result<Command> {
        Ok(self.resolve(name)?.command())
    }

    fn lookup_order(&self) -> Vec<String> {
        let mut order: Vec<String> = DEFAULT_RUNTIMES
            .iter()
            .map(|(ext, _)| ext.to_string())
            .filter(|ext| self.runtimes.contains_key(ext))
            .collect();
        let mut extra: Vec<String> = self
            .runtimes
            .keys()
            .filter(|ext| !order.contains(ext))
            .cloned()
            .collect();
        extra.sort_unstable();
        order.extend(extra);
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn launcher(dir: &TempDir) -> ScriptLauncher {
        let config = ShellConfig {
            scripts_dir: Some(dir.path().to_path_buf()),
            ..ShellConfig::with_home(dir.path())
        };
        ScriptLauncher::from_config(&config)
    }

    #[test]
    fn test_resolves_shell_entry() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("git-sync")).unwrap();
        fs::write(dir.path().join("git-sync/main.sh"), "echo hi\n").unwrap();

        let plan = launcher(&dir).resolve("git-sync").unwrap();
        assert_eq!(plan.entry, dir.path().join("git-sync/main.sh"));
        assert!(plan.program.ends_with("sh"));
    }

    #[test]
    fn test_builtin_order_wins() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("scan")).unwrap();
        fs::write(dir.path().join("scan/main.sh"), "").unwrap();
        fs::write(dir.path().join("scan/main.js"), "").unwrap();

        let plan = launcher(&dir).resolve("scan").unwrap();
        assert_eq!(plan.entry.extension().unwrap(), "js");
    }

    #[test]
    fn test_missing_script() {
        let dir = TempDir::new().unwrap();
        let err = launcher(&dir).resolve("nope").unwrap_err();
        assert!(matches!(err, ShellError::ScriptNotFound(name) if name == "nope"));
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let dir = TempDir::new().unwrap();
        assert!(launcher(&dir).resolve("../etc").is_err());
    }

    #[test]
    fn test_user_runtime_override() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tool")).unwrap();
        fs::write(dir.path().join("tool/main.rb"), "").unwrap();
        let mut runtimes = HashMap::new();
        runtimes.insert("rb".to_string(), "definitely-not-installed-ruby".to_string());
        let launcher = ScriptLauncher::new(dir.path(), runtimes);

        let plan = launcher.resolve("tool").unwrap();
        assert_eq!(plan.program, PathBuf::from("definitely-not-installed-ruby"));
    }
}
