//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for keeping credentials
//! out of logs.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a broker or database URL with its password masked.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
