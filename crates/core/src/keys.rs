//! Artifact key derivation.

use uuid::Uuid;

/// Deterministic blob-store key for a task's artifact.
pub fn artifact_key(account_hash: &str, bundle_id: &str, task_id: Uuid) -> String {
    format!("packages/{account_hash}/{bundle_id}/{task_id}.ipa")
}

/// Sibling temp key used while injection rewrites the archive tail.
///
/// The staging key exists only for the duration of an injection; the janitor
/// reaps stragglers left behind by crashed jobs.
pub fn staging_key(key: &str) -> String {
    format!("{key}.new")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            artifact_key("aaaaaaaa", "com.x.y", id),
            format!("packages/aaaaaaaa/com.x.y/{id}.ipa")
        );
    }

    #[test]
    fn staging_key_is_sibling() {
        assert_eq!(staging_key("packages/a/b/c.ipa"), "packages/a/b/c.ipa.new");
    }
}
