//! Ownership tagging convention.
//!
//! Every resource this tool creates is stamped with a fixed marker tuple so
//! that listing, mutation and deletion can be scoped to our own resources.
//! A resource is "ours" iff its `CreatedBy` tag equals [`MARKER_VALUE`]
//! exactly; anything else is foreign and must never be touched.

use std::collections::{BTreeMap, HashMap};
use std::env;

/// Tag key carrying the ownership marker.
pub const MARKER_KEY: &str = "CreatedBy";
/// Exact marker value proving this tool created a resource.
pub const MARKER_VALUE: &str = "opsdesk-selfservice";
/// Tag key recording the acting shell user.
pub const OWNER_KEY: &str = "Owner";
/// Tag key/value labelling the project.
pub const PROJECT_KEY: &str = "Project";
pub const PROJECT_VALUE: &str = "opsdesk";

/// Comment marker for Route 53 hosted zones, which have no tags on the
/// list path and use the zone comment field instead.
pub const ZONE_MARKER: &str = "Managed by opsdesk self-service";

fn acting_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// The fixed key/value pairs attached at resource-creation time.
pub fn standard_tags() -> BTreeMap<String, String> {
    BTreeMap::from([
        (MARKER_KEY.to_string(), MARKER_VALUE.to_string()),
        (OWNER_KEY.to_string(), acting_user()),
        (PROJECT_KEY.to_string(), PROJECT_VALUE.to_string()),
    ])
}

/// True iff the resource's marker tag equals the expected constant exactly.
/// Case-sensitive, no partial or prefix match.
pub fn is_owned(tags: &HashMap<String, String>) -> bool {
    tags.get(MARKER_KEY).map(String::as_str) == Some(MARKER_VALUE)
}

/// Zone variant of [`is_owned`], keyed on the hosted-zone comment.
pub fn zone_is_owned(comment: Option<&str>) -> bool {
    comment == Some(ZONE_MARKER)
}
