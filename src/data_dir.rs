use crate::config::WatchdogConfig;
use std::path::{Path, PathBuf};

/// Manages the watchdog's data directory (default `~/.gateway-watchdog/`).
///
/// Holds the persisted state, the run lock, and the default config file.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the persisted watchdog state.
    pub fn state(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Path to the advisory lock serializing remediations.
    pub fn lock(&self) -> PathBuf {
        self.root.join("run.lock")
    }

    /// Path to the config file (e.g. `~/.gateway-watchdog/config.toml`).
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Create the directory and write a default `config.toml` if none exists.
    /// Returns Ok(true) if the config file was written.
    pub fn init(&self) -> std::io::Result<bool> {
        std::fs::create_dir_all(&self.root)?;
        let config_path = self.config();
        if config_path.exists() {
            return Ok(false);
        }
        let rendered = toml::to_string_pretty(&WatchdogConfig::default())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let contents = format!(
            "# gateway-watchdog configuration\n# Every key is optional; shown values are the defaults.\n\n{rendered}"
        );
        std::fs::write(&config_path, contents)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_paths() {
        let dd = DataDir::new("/home/ops/.gateway-watchdog");
        assert_eq!(dd.root(), Path::new("/home/ops/.gateway-watchdog"));
        assert_eq!(
            dd.state(),
            PathBuf::from("/home/ops/.gateway-watchdog/state.json")
        );
        assert_eq!(dd.lock(), PathBuf::from("/home/ops/.gateway-watchdog/run.lock"));
        assert_eq!(
            dd.config(),
            PathBuf::from("/home/ops/.gateway-watchdog/config.toml")
        );
    }

    #[test]
    fn test_init_writes_parseable_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".gateway-watchdog"));

        assert!(dd.init().unwrap());
        let contents = std::fs::read_to_string(dd.config()).unwrap();
        assert!(contents.contains("[crash]"));
        assert!(contents.contains("[repair_agent]"));

        let parsed = WatchdogConfig::load(&dd.config()).unwrap();
        assert_eq!(parsed.crash.threshold, WatchdogConfig::default().crash.threshold);
    }

    #[test]
    fn test_init_does_not_overwrite_existing_config() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".gateway-watchdog"));
        dd.init().unwrap();

        let custom = "[crash]\nthreshold = 9\n";
        std::fs::write(dd.config(), custom).unwrap();

        assert!(!dd.init().unwrap());
        assert_eq!(std::fs::read_to_string(dd.config()).unwrap(), custom);
    }
}
