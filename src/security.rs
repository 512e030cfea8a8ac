#![forbid(unsafe_code)]

//! Guards applied before anything touches the host: the process identity
//! check run at startup, validation of caller supplied source URLs, and the
//! browser origins allowed to call the gateway.

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use url::Url;

use crate::error::GatewayError;

pub const MAX_SOURCE_URL_LEN: usize = 2048;

/// Fails fast when the gateway is started as root. Extractor children inherit
/// the gateway's uid, so they must never run privileged.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Checks that `raw` is an absolute http(s) URL and returns it trimmed.
///
/// The value is returned as received rather than re-serialized: it is handed
/// to the extractor as one opaque argument, so there is nothing to escape.
pub fn validate_source_url(raw: &str) -> Result<String, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::invalid_request("missing 'url' query parameter"));
    }
    if trimmed.len() > MAX_SOURCE_URL_LEN {
        return Err(GatewayError::invalid_request(format!(
            "url exceeds {MAX_SOURCE_URL_LEN} bytes"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(GatewayError::invalid_request(
            "url contains control characters",
        ));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|err| GatewayError::invalid_request(format!("url is not valid: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::invalid_request("url must use http or https"));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(GatewayError::invalid_request("url must include a host"));
    }
    Ok(trimmed.to_string())
}

/// Reduces a configured CORS origin to `scheme://host[:port]`. Paths,
/// queries and non-http schemes are configuration mistakes.
pub fn normalize_origin(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = Url::parse(trimmed).with_context(|| format!("invalid origin '{raw}'"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        bail!("origin '{raw}' must look like https://example.com");
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        bail!("origin '{raw}' must not carry a path, query or fragment");
    }
    Ok(parsed.origin().ascii_serialization())
}
