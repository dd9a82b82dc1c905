use crate::transport::DEFAULT_COMMAND;
use crate::utils::{get_data_dir, get_dryrun_dir};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Operator settings for the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where dry-run scripts are written. `None` uses the XDG data dir.
    #[serde(default)]
    pub dryrun_dir: Option<PathBuf>,
    /// Command a script is piped into. `{host}` and `{port}` are substituted.
    #[serde(default = "default_transport_command")]
    pub transport_command: String,
    /// Hide per-unit ✓/❌ lines in generated scripts
    #[serde(default)]
    pub quiet: bool,
    /// Record renders and dispatches in the audit log
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dryrun_dir: None,
            transport_command: default_transport_command(),
            quiet: false,
            enable_audit_log: true,
        }
    }
}

impl AppConfig {
    /// The configured dry-run directory, or the default one.
    pub fn dryrun_dir(&self) -> Option<PathBuf> {
        self.dryrun_dir.clone().or_else(get_dryrun_dir)
    }
}

fn default_transport_command() -> String {
    DEFAULT_COMMAND.to_string()
}

fn default_true() -> bool {
    true
}

/// Saves the config to disk using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(dir) = get_data_dir() {
        save_config_in(&dir, config).await?;
    }
    Ok(())
}

async fn save_config_in(dir: &std::path::Path, config: &AppConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    tokio::fs::create_dir_all(dir).await?;
    let temp_path = dir.join("config.json.tmp");
    let path = dir.join("config.json");

    // Permissions are set at creation, before any data is written
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from disk, or returns the default if not found.
pub async fn load_config() -> AppConfig {
    match get_data_dir() {
        Some(dir) => load_config_in(&dir).await,
        None => AppConfig::default(),
    }
}

async fn load_config_in(dir: &std::path::Path) -> AppConfig {
    let path = dir.join("config.json");
    if let Ok(json) = tokio::fs::read_to_string(&path).await {
        match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => return config,
            Err(e) => tracing::warn!("Ignoring invalid {}: {}", path.display(), e),
        }
    }
    AppConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: AppConfig = serde_json::from_str(r#"{"quiet": true}"#).unwrap();
        assert!(config.quiet);
        assert_eq!(config.transport_command, DEFAULT_COMMAND);
        assert!(config.enable_audit_log);
        assert!(config.dryrun_dir.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            dryrun_dir: Some(PathBuf::from("/tmp/drnet-dryruns")),
            transport_command: "bash -s".to_string(),
            quiet: true,
            enable_audit_log: false,
        };
        save_config_in(dir.path(), &config).await.unwrap();
        assert!(!dir.path().join("config.json.tmp").exists());
        assert_eq!(load_config_in(dir.path()).await, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("config.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_invalid_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "not json").unwrap();
        assert_eq!(load_config_in(dir.path()).await, AppConfig::default());
    }
}
