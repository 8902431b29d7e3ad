//! Key layout of the job store.
//!
//! ```text
//! /jobs/{jid}                      active job record
//! /locked/jobs/{jid}               lock record
//! /archive/jobs/{jid}              terminal job record
//! /by/project/{project}/{jid}      empty-valued project index entry
//! ```

pub const ACTIVE_PREFIX: &str = "/jobs/";
pub const LOCK_PREFIX: &str = "/locked/jobs/";
pub const ARCHIVE_PREFIX: &str = "/archive/jobs/";
pub const PROJECT_PREFIX: &str = "/by/project/";

pub fn active(jid: &str) -> String {
    format!("{ACTIVE_PREFIX}{jid}")
}

pub fn lock(jid: &str) -> String {
    format!("{LOCK_PREFIX}{jid}")
}

pub fn archive(jid: &str) -> String {
    format!("{ARCHIVE_PREFIX}{jid}")
}

pub fn project_prefix(project_id: &str) -> String {
    format!("{PROJECT_PREFIX}{project_id}/")
}

pub fn project_entry(project_id: &str, jid: &str) -> String {
    format!("{PROJECT_PREFIX}{project_id}/{jid}")
}

/// Strips `prefix` from each listed key, leaving the trailing id.
pub fn ids_under(prefix: &str, keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .filter_map(|key| key.strip_prefix(prefix).map(str::to_string))
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .collect()
}
