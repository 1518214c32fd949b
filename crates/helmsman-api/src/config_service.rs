//! Configuration-service contract.
//!
//! The services that yield deployment parameters, image metadata, and
//! configuration revisions are external collaborators; intake only
//! needs the three lookups below. `StaticConfigurationService` is the
//! canned implementation used in tests and single-box setups.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use helmsman_store::Parameters;

/// A configuration-service lookup failure.
#[derive(Debug, Error)]
#[error("configuration service error: {0}")]
pub struct ConfigServiceError(pub String);

/// External configuration lookups intake depends on.
#[async_trait]
pub trait ConfigurationService: Send + Sync {
    /// The application name embedded in a machine image, if the image
    /// is known.
    async fn image_application(&self, ami: &str) -> Result<Option<String>, ConfigServiceError>;

    /// The configuration revision for an application/environment.
    async fn commit_hash(
        &self,
        application: &str,
        environment: &str,
    ) -> Result<Option<String>, ConfigServiceError>;

    /// Default deployment parameters for an application in a region.
    async fn deployment_parameters(
        &self,
        application: &str,
        environment: &str,
        region: &str,
    ) -> Result<Parameters, ConfigServiceError>;
}

/// In-memory configuration source.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigurationService {
    /// AMI → application name.
    images: HashMap<String, String>,
    /// `{application}-{environment}` → configuration revision.
    hashes: HashMap<String, String>,
    /// `{application}-{environment}-{region}` → parameters.
    parameters: HashMap<String, Parameters>,
}

impl StaticConfigurationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, ami: &str, application: &str) -> Self {
        self.images.insert(ami.to_string(), application.to_string());
        self
    }

    pub fn with_hash(mut self, application: &str, environment: &str, hash: &str) -> Self {
        self.hashes
            .insert(format!("{application}-{environment}"), hash.to_string());
        self
    }

    pub fn with_parameters(
        mut self,
        application: &str,
        environment: &str,
        region: &str,
        parameters: Parameters,
    ) -> Self {
        self.parameters
            .insert(format!("{application}-{environment}-{region}"), parameters);
        self
    }
}

#[async_trait]
impl ConfigurationService for StaticConfigurationService {
    async fn image_application(&self, ami: &str) -> Result<Option<String>, ConfigServiceError> {
        Ok(self.images.get(ami).cloned())
    }

    async fn commit_hash(
        &self,
        application: &str,
        environment: &str,
    ) -> Result<Option<String>, ConfigServiceError> {
        Ok(self.hashes.get(&format!("{application}-{environment}")).cloned())
    }

    async fn deployment_parameters(
        &self,
        application: &str,
        environment: &str,
        region: &str,
    ) -> Result<Parameters, ConfigServiceError> {
        Ok(self
            .parameters
            .get(&format!("{application}-{environment}-{region}"))
            .cloned()
            .unwrap_or_default())
    }
}
