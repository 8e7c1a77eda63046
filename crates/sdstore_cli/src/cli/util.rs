//! Shared CLI utilities: building a `Coordinator` and printing errors.

use std::sync::Arc;

use sdstore_core::config::Config;
use sdstore_core::coordinator::Coordinator;
use sdstore_core::error::SdError;
use sdstore_core::fs::NativeFsAdapter;
use sdstore_core::metadata_cache::MetadataCache;

/// Build a coordinator backed by the native filesystem and this profile's
/// persisted instance id, registering every SD the profile remembers.
pub async fn build_coordinator() -> Result<(Coordinator, Config), SdError> {
    let config = Config::load_or_create()?;
    let metadata_path = Config::config_path()
        .ok_or_else(|| SdError::Internal("no data directory for this platform".to_string()))?
        .with_file_name("metadata.sqlite3");
    let metadata = MetadataCache::open(&metadata_path)?;

    let coordinator = Coordinator::new(Arc::new(NativeFsAdapter::new()), config.instance_id.clone(), metadata);
    for entry in &config.sds {
        coordinator.register_sd(entry.id.clone(), entry.path.clone()).await?;
    }
    Ok((coordinator, config))
}

/// Print an error to stderr in the CLI's conventional style and exit with a
/// non-zero status.
pub fn fail(err: &SdError) -> ! {
    eprintln!("✗ {err}");
    std::process::exit(1);
}
