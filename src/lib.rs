pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod imagefile;
pub mod images;
pub mod locks;
pub mod materialize;
pub mod paths;
pub mod permissions;
pub mod response;
pub mod search;
pub mod storage;

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use crate::config::ConfigManager;
use crate::db::Database;
use crate::storage::LocalFileStore;

pub use crate::config::LibraryConfig;
pub use crate::engine::{DeletedFolder, Outcome, Placement, Reconciler};
pub use crate::error::{LibraryError, Result};
pub use crate::materialize::MaterializeReport;
pub use crate::permissions::{Action, PermissionPolicy, User};
pub use crate::response::ApiResponse;
pub use crate::search::SearchIndexer;

/// Terminal output at `level`, plus a debug-level `media-folders.log` in
/// `log_dir`. Safe to call more than once; later calls are ignored.
pub fn init_logging(log_dir: &Path, level: log::LevelFilter) {
    use simplelog::*;

    let term: Box<dyn SharedLogger> = TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    let file = fs::create_dir_all(log_dir)
        .and_then(|_| File::create(log_dir.join("media-folders.log")));

    let result = match file {
        Ok(file) => CombinedLogger::init(vec![
            term,
            WriteLogger::new(LevelFilter::Debug, Config::default(), file),
        ]),
        Err(e) => {
            eprintln!("Log file unavailable in {:?}: {}", log_dir, e);
            CombinedLogger::init(vec![term])
        }
    };
    if result.is_ok() {
        log::info!("Logging initialized");
    }
}

/// Loads the config file, sets up logging and the catalog, and returns an
/// engine working on the local filesystem.
pub fn open_library(
    config_path: &Path,
    policy: Arc<dyn PermissionPolicy>,
    indexer: Arc<dyn SearchIndexer>,
) -> Result<Reconciler> {
    let config = ConfigManager::new(config_path).current()?;
    config.validate()?;

    init_logging(&config.log_dir(), config.level_filter());

    let resolver = paths::PathResolver::new(&config.media_root, config.images_dir.clone());
    fs::create_dir_all(resolver.root().absolute)?;
    let catalog = Database::new(&config.database_path())?;

    log::info!("Media library opened at {:?}", config.media_root);
    Ok(Reconciler::new(
        &config,
        Arc::new(catalog),
        Arc::new(LocalFileStore),
        policy,
        indexer,
    ))
}
