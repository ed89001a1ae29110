//! Registry validation: relationship targets and slug uniqueness. Runs once at boot; any error is fatal.

use crate::config::Registry;
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};

pub fn validate(registry: &Registry) -> Result<(), ConfigError> {
    let names: HashSet<&str> = registry.all().iter().map(|r| r.name.as_str()).collect();

    let mut slugs: HashMap<&str, &str> = HashMap::new();
    for r in registry.all() {
        if let Some(first) = slugs.insert(r.slug.as_str(), r.name.as_str()) {
            return Err(ConfigError::DuplicateSlug {
                slug: r.slug.clone(),
                first: first.to_string(),
                second: r.name.clone(),
            });
        }
    }

    for r in registry.all() {
        let mut keys = HashSet::new();
        for f in &r.fields {
            if let Some(rel) = f.relation() {
                if !names.contains(rel.target.as_str()) {
                    return Err(ConfigError::MissingReference {
                        kind: "relationship target",
                        id: format!("{}.{}", r.name, rel.target),
                    });
                }
            } else if !keys.insert(f.database_field.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "resource '{}' declares field '{}' twice",
                    r.name, f.database_field
                )));
            }
        }
        for a in &r.actions {
            if r.actions.iter().filter(|other| other.slug == a.slug).count() > 1 {
                return Err(ConfigError::Validation(format!(
                    "resource '{}' declares action '{}' twice",
                    r.name, a.slug
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::field::text;
    use crate::config::resource::{action, resource};
    use crate::config::Registry;
    use crate::error::ConfigError;

    #[test]
    fn rejects_slug_collision() {
        let err = Registry::register([resource("Blog Post"), resource("Blog-Post")]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSlug { .. }));
    }

    #[test]
    fn rejects_duplicate_field() {
        let err = Registry::register([resource("Post").fields([text("Title"), text("title")])]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_action() {
        let err =
            Registry::register([resource("Post").actions([action("Archive"), action("archive")])]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
