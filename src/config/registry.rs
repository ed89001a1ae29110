//! Resource registry: the immutable, deduplicated set of resources built once at boot.

use crate::config::resource::ResourceDescriptor;
use crate::config::system::{
    administrator_resource, permission_resource, role_resource, ADMINISTRATOR, ADMINISTRATOR_PERMISSION,
    ADMINISTRATOR_ROLE,
};
use crate::config::validate;
use crate::error::{AppError, ConfigError};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug)]
pub struct Registry {
    resources: Vec<ResourceDescriptor>,
    by_slug: HashMap<String, usize>,
}

impl Registry {
    /// Build the registry from user declarations. The three administrator resources are
    /// injected ahead of them. Names are deduplicated keeping the first occurrence: a later
    /// declaration with an already-seen name is dropped silently, so the last registration
    /// never wins (a user resource named "Administrator" is ignored in favour of the system one).
    pub fn register(
        resources: impl IntoIterator<Item = ResourceDescriptor>,
    ) -> Result<Registry, ConfigError> {
        let combined = [administrator_resource(), role_resource(), permission_resource()]
            .into_iter()
            .chain(resources);

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for resource in combined {
            if seen.insert(resource.name.clone()) {
                unique.push(resource);
            } else {
                tracing::debug!(resource = %resource.name, "duplicate resource registration dropped");
            }
        }

        let registry = Registry::from_unique(unique);
        validate(&registry)?;
        tracing::info!(resources = registry.resources.len(), "resource registry built");
        Ok(registry)
    }

    fn from_unique(resources: Vec<ResourceDescriptor>) -> Self {
        let mut by_slug = HashMap::new();
        for (i, r) in resources.iter().enumerate() {
            by_slug.entry(r.slug.clone()).or_insert(i);
        }
        Registry { resources, by_slug }
    }

    pub fn find(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn by_slug(&self, slug: &str) -> Option<&ResourceDescriptor> {
        self.by_slug.get(slug).map(|&i| &self.resources[i])
    }

    /// All resources in registration order (system resources first).
    pub fn all(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    /// Resource by name, or a request-time configuration error.
    pub fn require(&self, name: &str) -> Result<&ResourceDescriptor, AppError> {
        self.find(name)
            .ok_or_else(|| AppError::Configuration(format!("resource '{}' is not registered", name)))
    }

    pub fn administrator(&self) -> Result<&ResourceDescriptor, AppError> {
        self.require(ADMINISTRATOR)
    }

    pub fn role(&self) -> Result<&ResourceDescriptor, AppError> {
        self.require(ADMINISTRATOR_ROLE)
    }

    pub fn permission(&self) -> Result<&ResourceDescriptor, AppError> {
        self.require(ADMINISTRATOR_PERMISSION)
    }
}
