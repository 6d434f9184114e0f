use std::path::Path;

use anyhow::Context;
use veriq_core::config::Config;
use veriq_core::keyring::KeyStatus;
use veriq_core::{io, paths};

use crate::output::print_json;

/// Idempotent: an existing veriq.yaml and key table are left alone.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config_path = paths::config_path(root);
    let yaml = serde_yaml::to_string(&Config::default())?;
    let wrote_config = io::write_if_missing(&config_path, yaml.as_bytes())
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    let platform = super::open_platform(root)?;
    let active = platform
        .keys()?
        .into_iter()
        .find(|k| k.status == KeyStatus::Active)
        .map(|k| k.kid);

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "config": config_path.display().to_string(),
            "config_created": wrote_config,
            "active_kid": active,
        }))?;
    } else {
        println!("Initialized veriq in {}", paths::data_dir(root).display());
        if let Some(kid) = active {
            println!("Active signing key: {kid}");
        }
    }
    Ok(())
}
