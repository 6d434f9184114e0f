pub mod anchor;
pub mod canon;
pub mod config;
pub mod init;
pub mod keys;
pub mod serve;
pub mod status;
pub mod verify;
pub mod work;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use veriq_core::config::Config;
use veriq_core::events::NullSink;
use veriq_core::{paths, Platform};

/// Open the platform at `root` for a one-shot command. Events go nowhere;
/// the persisted log still records them.
pub fn open_platform(root: &Path) -> anyhow::Result<Platform> {
    let config = Config::load(root).context("failed to load config")?;
    Platform::open(root, config, Arc::new(NullSink))
        .with_context(|| format!("failed to open {}", paths::db_path(root).display()))
}
