use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::{
    config::{AdminConfig, Config},
    database::ShoutDatabase,
    infrastructure::{
        identity::{GatewayAssertionVerifier, IdentityVerifier},
        middleware::HasViewerResolution,
        object_store::{object_store_from_config, ObjectStore},
    },
    services::UploadManager,
    shout_interface::ShoutInterface,
};

#[derive(Clone)]
pub struct AppState {
    pub shout_interface: ShoutInterface,
    pub identity: Arc<dyn IdentityVerifier>,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        ensure_sqlite_parent_dir(&config.database.url).await?;

        let database = ShoutDatabase::new(&config.database.url).await?;
        database.init().await?;
        info!("Database ready at {}", config.database.url);

        // A partial storage configuration refuses to start
        let object_store = object_store_from_config(config.object_store.as_ref())?;

        let uploads = UploadManager::new(&config.uploads.dir, config.uploads.max_bytes).await?;
        info!(
            "Storing uploads in {} (max {} bytes)",
            config.uploads.dir.display(),
            config.uploads.max_bytes
        );

        Ok(Self::with_components(
            config,
            Arc::new(database),
            Arc::new(uploads),
            object_store,
            Arc::new(GatewayAssertionVerifier::new()),
        ))
    }

    /// Assemble state from already-built parts (used by tests)
    pub fn with_components(
        config: Config,
        database: Arc<ShoutDatabase>,
        uploads: Arc<UploadManager>,
        object_store: Option<Arc<dyn ObjectStore>>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            shout_interface: ShoutInterface::new(database, uploads, object_store),
            identity,
            config,
        }
    }
}

impl HasViewerResolution for AppState {
    fn database(&self) -> &ShoutDatabase {
        self.shout_interface.database()
    }

    fn identity(&self) -> &Arc<dyn IdentityVerifier> {
        &self.identity
    }

    fn admin_config(&self) -> &AdminConfig {
        &self.config.admin
    }
}

// SQLite creates the file but not its directory
async fn ensure_sqlite_parent_dir(database_url: &str) -> anyhow::Result<()> {
    let path = match database_url.strip_prefix("sqlite://").or_else(|| database_url.strip_prefix("sqlite:")) {
        Some(path) => path.split('?').next().unwrap_or_default(),
        None => return Ok(()),
    };
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
