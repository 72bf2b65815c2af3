//! Tenant resolution from the `X-Scope-OrgID` header.
//!
//! Multi-tenant requests carry several ids separated by `|`. The
//! resolved set is sorted and de-duplicated so limit resolution and
//! header re-injection are deterministic.

use axum::http::{header::HeaderName, HeaderMap, HeaderValue};

use crate::error::{Error, Result};

/// Header carrying the tenant id(s) on inbound and downstream requests.
pub const ORG_ID_HEADER: &str = "X-Scope-OrgID";

/// Optional opaque tags forwarded verbatim to the downstream.
pub const QUERY_TAGS_HEADER: &str = "X-Query-Tags";

/// Extract the tenant set from request headers.
///
/// Fails with a bad request when the header is absent, unreadable, or
/// contains no non-empty id.
pub fn tenants_from_headers(headers: &HeaderMap) -> Result<Vec<String>> {
    let raw = headers
        .get(ORG_ID_HEADER)
        .ok_or_else(|| Error::bad_request("no org id"))?
        .to_str()
        .map_err(|_| Error::bad_request("invalid org id header"))?;

    let mut tenants: Vec<String> = raw
        .split('|')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tenants.sort();
    tenants.dedup();

    if tenants.is_empty() {
        return Err(Error::bad_request("no org id"));
    }
    Ok(tenants)
}

/// Inject the tenant set into a downstream request's headers.
pub fn inject_org_id(headers: &mut HeaderMap, tenants: &[String]) -> Result<()> {
    let joined = tenants.join("|");
    let value = HeaderValue::from_str(&joined)
        .map_err(|_| Error::bad_request("invalid org id header"))?;
    headers.insert(HeaderName::from_static("x-scope-orgid"), value);
    Ok(())
}
