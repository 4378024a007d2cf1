//! JSON merge patch (RFC 7386) for versioned resources

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::RegistryError;
use crate::resource::Resource;

/// Apply `patch` to a copy of `current`.
///
/// Present keys overwrite, `null` removes a key, absent keys are kept.
/// Identity fields cannot change. The result's `last_updated` is `now`,
/// never earlier than the version being patched.
pub fn apply_merge_patch<R: Resource>(
    current: &R,
    patch: &Value,
    now: DateTime<Utc>,
) -> Result<R, RegistryError> {
    if !patch.is_object() {
        return Err(RegistryError::InvalidPatch(
            "patch document must be a JSON object".to_string(),
        ));
    }

    let mut doc = serde_json::to_value(current)?;
    json_patch::merge(&mut doc, patch);

    let mut patched: R = serde_json::from_value(doc)
        .map_err(|e| RegistryError::InvalidPatch(format!("patched {} is invalid: {}", R::KIND, e)))?;

    if patched.key() != current.key() {
        return Err(RegistryError::InvalidPatch(format!(
            "{} identity cannot be changed from {} to {}",
            R::KIND,
            current.key(),
            patched.key()
        )));
    }

    patched.validate().map_err(RegistryError::InvalidPatch)?;
    patched.set_last_updated(now.max(current.last_updated()));

    Ok(patched)
}
