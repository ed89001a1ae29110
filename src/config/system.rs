//! Implicit administrator resources injected ahead of user declarations.

use crate::config::field::{belongs_to_many, text};
use crate::config::resource::{resource, ResourceDescriptor};
use crate::response::Record;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHasher};
use serde_json::Value;

pub const ADMINISTRATOR: &str = "Administrator";
pub const ADMINISTRATOR_ROLE: &str = "Administrator Role";
pub const ADMINISTRATOR_PERMISSION: &str = "Administrator Permission";

pub const SUPER_ADMIN_SLUG: &str = "super-admin";
pub const SUPER_ADMIN_NAME: &str = "Super Admin";

pub fn administrator_resource() -> ResourceDescriptor {
    resource(ADMINISTRATOR)
        .hide_from_navigation()
        .fields([
            text("Name"),
            text("Email").unique().searchable().rules(["required", "email"]),
            text("Password").hidden().rules(["required", "min:8"]),
            belongs_to_many(ADMINISTRATOR_ROLE),
        ])
        .before_create(hash_password)
        .before_update(hash_password)
}

pub fn role_resource() -> ResourceDescriptor {
    resource(ADMINISTRATOR_ROLE).hide_from_navigation().fields([
        text("Name").rules(["required"]).unique(),
        text("Slug").rules(["required"]).unique(),
        belongs_to_many(ADMINISTRATOR),
        belongs_to_many(ADMINISTRATOR_PERMISSION),
    ])
}

pub fn permission_resource() -> ResourceDescriptor {
    resource(ADMINISTRATOR_PERMISSION).hide_from_navigation().fields([
        text("Name"),
        text("Slug").rules(["required"]).unique(),
        belongs_to_many(ADMINISTRATOR_ROLE),
    ])
}

/// Replace a plaintext `password` with its argon2 hash. Payloads without a password, or whose
/// password is already a hash, pass through unchanged. A plaintext password is never kept.
fn hash_password(mut payload: Record) -> Record {
    let plain = match payload.get("password") {
        Some(Value::String(s)) if !s.starts_with("$argon2") => s.clone(),
        _ => return payload,
    };
    let salt = SaltString::generate(&mut OsRng);
    match Argon2::default().hash_password(plain.as_bytes(), &salt) {
        Ok(hash) => {
            payload.insert("password".into(), Value::String(hash.to_string()));
        }
        Err(e) => {
            tracing::error!("failed to hash administrator password: {}", e);
            payload.remove("password");
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn administrator_hook_hashes_password() {
        let admin = administrator_resource();
        let mut payload = Record::new();
        payload.insert("email".into(), json!("a@b.c"));
        payload.insert("password".into(), json!("secret-password"));
        let out = admin.apply_before_create(payload);
        let hashed = out.get("password").and_then(Value::as_str).unwrap();
        assert!(hashed.starts_with("$argon2"));

        let again = admin.apply_before_update(out.clone());
        assert_eq!(again.get("password"), out.get("password"));
    }

    #[test]
    fn update_without_password_is_untouched() {
        let admin = administrator_resource();
        let mut payload = Record::new();
        payload.insert("name".into(), json!("Kim"));
        let out = admin.apply_before_update(payload.clone());
        assert_eq!(out, payload);
    }
}
