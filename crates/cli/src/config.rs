use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tollgate_cache::ResourceMetadata;
use tollgate_common::AppConfig;
use tracing::info;

/// Resolved configuration with the paths it came from.
pub struct CliConfig {
    pub config: AppConfig,
    pub config_path: PathBuf,
    pub resources: BTreeMap<String, ResourceMetadata>,
}

impl CliConfig {
    pub fn load(path: &str, resources_path: Option<&str>) -> Result<Self> {
        info!(path = path, "loading configuration");
        let config = AppConfig::load(path).with_context(|| format!("loading {}", path))?;

        let resources = match resources_path {
            Some(resources_path) => load_resources(resources_path)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            config,
            config_path: PathBuf::from(path),
            resources,
        })
    }
}

/// Read a YAML map of resource key to metadata.
pub fn load_resources(path: &str) -> Result<BTreeMap<String, ResourceMetadata>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let resources: BTreeMap<String, ResourceMetadata> =
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path))?;
    info!(path = path, count = resources.len(), "loaded resource metadata");
    Ok(resources)
}
