//! Input validation for client-supplied identifiers and URLs.

use crate::error::{Error, Result};
use url::{Host, Url};

/// Validate a tenant identifier.
///
/// The account hash is opaque to the server but becomes a path segment of the
/// artifact key, so it is constrained to path-safe characters.
pub fn validate_account_hash(hash: &str) -> Result<()> {
    if hash.len() < 8 || hash.len() > 64 {
        return Err(Error::BadRequest(
            "accountHash must be 8-64 characters".to_string(),
        ));
    }
    if !hash
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::BadRequest(
            "accountHash contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate a bundle identifier for use inside an artifact key.
pub fn validate_bundle_id(bundle_id: &str) -> Result<()> {
    if bundle_id.is_empty() || bundle_id.len() > 256 {
        return Err(Error::BadRequest("invalid bundleID".to_string()));
    }
    if !bundle_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::BadRequest(
            "bundleID contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate a CDN download URL: https, an Apple hostname, never an IP literal.
pub fn validate_download_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::BadRequest(format!("invalid URL: {e}")))?;

    if url.scheme() != "https" {
        return Err(Error::BadRequest(
            "download URL must use https".to_string(),
        ));
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            // A dotted-quad parses as Host::Domain on some url versions when
            // not syntactically canonical; reject anything that parses as IPv4.
            if domain.parse::<std::net::Ipv4Addr>().is_ok() {
                return Err(Error::BadRequest(
                    "download URL must not be an IP literal".to_string(),
                ));
            }
            let domain = domain.to_ascii_lowercase();
            if domain != "apple.com" && !domain.ends_with(".apple.com") {
                return Err(Error::BadRequest(
                    "download URL host must be an apple.com domain".to_string(),
                ));
            }
        }
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
            return Err(Error::BadRequest(
                "download URL must not be an IP literal".to_string(),
            ));
        }
        None => {
            return Err(Error::BadRequest("download URL has no host".to_string()));
        }
    }

    Ok(url)
}

/// Sanitize a user-visible name for use in a Content-Disposition filename.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | '"' | ';' | ':' | '*' | '?' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "package".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_hash_length_and_charset() {
        assert!(validate_account_hash("aaaaaaaa").is_ok());
        assert!(validate_account_hash("AB-12_cd9").is_ok());
        assert!(validate_account_hash("short").is_err());
        assert!(validate_account_hash("has/slash").is_err());
        assert!(validate_account_hash("dot.dot.x").is_err());
        assert!(validate_account_hash(&"a".repeat(65)).is_err());
    }

    #[test]
    fn bundle_id_charset() {
        assert!(validate_bundle_id("com.example.app").is_ok());
        assert!(validate_bundle_id("com.example-app_2").is_ok());
        assert!(validate_bundle_id("").is_err());
        assert!(validate_bundle_id("com/example").is_err());
    }

    #[test]
    fn download_url_requires_https_apple() {
        assert!(validate_download_url("https://cdn.apple.com/x.ipa").is_ok());
        assert!(validate_download_url("https://iosapps.itunes.apple.com/x").is_ok());
        assert!(validate_download_url("http://cdn.apple.com/x.ipa").is_err());
        assert!(validate_download_url("https://apple.com.evil.com/x").is_err());
        assert!(validate_download_url("https://evil.com/x").is_err());
        assert!(validate_download_url("not a url").is_err());
    }

    #[test]
    fn download_url_rejects_ip_literals() {
        assert!(validate_download_url("https://17.0.0.1/x.ipa").is_err());
        assert!(validate_download_url("https://[2620:149::1]/x.ipa").is_err());
    }

    #[test]
    fn filename_sanitization() {
        assert_eq!(sanitize_filename("My App"), "My App");
        assert_eq!(sanitize_filename("a/b\\c\"d"), "a_b_c_d");
        assert_eq!(sanitize_filename("  "), "package");
    }
}
