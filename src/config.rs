use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_batch_size() -> usize {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_retry_ceiling() -> u32 {
    crate::refresh::DEFAULT_RETRY_CEILING
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub database: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_ceiling")]
    pub sweep_retry_ceiling: u32,
    #[serde(default)]
    pub assert_graph_integrity: bool,
    #[serde(default)]
    pub assert_referential_integrity: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            database: None,
            batch_size: default_batch_size(),
            workers: default_workers(),
            sweep_retry_ceiling: default_retry_ceiling(),
            assert_graph_integrity: false,
            assert_referential_integrity: false,
        }
    }
}

impl RefreshConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("invrefresh.toml")
}

pub fn default_database_path() -> PathBuf {
    PathBuf::from(".invrefresh").join("inventory.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<RefreshConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: RefreshConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &RefreshConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
