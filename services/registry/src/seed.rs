use camino::Utf8Path;
use store::ServerJson;

use crate::error::{RegistryError, RegistryResult};
use crate::service::RegistryService;

/// Outcome of a seed import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Versions newly published.
    pub published: usize,
    /// Versions already present.
    pub skipped: usize,
}

impl RegistryService {
    /// Publish every server in a JSON array file.
    ///
    /// Versions that already exist are skipped, so importing the same file
    /// twice is harmless.
    #[tracing::instrument(skip(self))]
    pub async fn import_seed(&self, path: &Utf8Path) -> RegistryResult<SeedReport> {
        let contents = tokio::fs::read(path).await?;
        let servers: Vec<ServerJson> = serde_json::from_slice(&contents)
            .map_err(|error| RegistryError::InvalidInput(format!("seed {path}: {error}")))?;
        self.import_servers(servers).await
    }

    /// Publish each server, skipping versions that already exist.
    pub async fn import_servers(&self, servers: Vec<ServerJson>) -> RegistryResult<SeedReport> {
        let mut report = SeedReport::default();
        for server in servers {
            let key = format!("{}@{}", server.name, server.version);
            match self.publish(server).await {
                Ok(_) => report.published += 1,
                Err(RegistryError::VersionExists { .. }) => {
                    tracing::debug!(%key, "seed version already present");
                    report.skipped += 1;
                }
                Err(error) => return Err(error),
            }
        }
        tracing::info!(
            published = report.published,
            skipped = report.skipped,
            "imported seed"
        );
        Ok(report)
    }
}
