//! Secret resolution for tool providers: environment first, then a
//! `.secrets/<ref>` file under the working directory.

/// Resolves a `secret_ref` to its value, or `None` when the secret cannot be
/// found. Never errors; a missing secret is the provider's problem to report.
pub fn resolve_secret(secret_ref: Option<&str>) -> Option<String> {
    let secret_ref = secret_ref?.trim();
    if secret_ref.is_empty() {
        return None;
    }
    if let Ok(value) = std::env::var(secret_ref) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    let path = std::path::Path::new(".secrets").join(secret_ref);
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_wins() {
        std::env::set_var("ARBOR_TEST_SECRET_REF", "from-env");
        assert_eq!(
            resolve_secret(Some("ARBOR_TEST_SECRET_REF")).as_deref(),
            Some("from-env")
        );
        std::env::remove_var("ARBOR_TEST_SECRET_REF");
    }

    #[test]
    fn missing_secret_is_none() {
        assert_eq!(resolve_secret(Some("ARBOR_TEST_SECRET_MISSING")), None);
        assert_eq!(resolve_secret(None), None);
        assert_eq!(resolve_secret(Some("  ")), None);
    }
}
