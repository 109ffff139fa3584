//! Repository index model and builder
//!
//! [`build_index`] is a pure function of an [`ObjectSnapshot`] and a base
//! URL: the same inputs always produce the same entries, only the
//! `generated` stamp differs between builds.
//!
//! Package archives are recognized by their `<name>-<version>.tgz` file
//! name. The name may itself contain dashes; the split happens at the
//! first dash whose remainder is a valid semantic version. Provenance files
//! travel alongside packages and are never indexed.

use super::object_cache::ObjectSnapshot;
use super::version::SemVer;
use crate::error::{RepoError, Result};
use crate::storage::{StorageObject, PACKAGE_SUFFIX};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Index format tag
pub const API_VERSION: &str = "v1";

static CHART_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("chart name pattern is valid")
});

/// One published version of a chart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    pub name: String,
    pub version: String,
    pub digest: String,
    pub urls: Vec<String>,
    pub created: DateTime<Utc>,
}

/// Queryable index of every chart version in a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIndex {
    pub api_version: String,
    /// Chart name -> versions, highest version first
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
    pub generated: DateTime<Utc>,
}

impl RepositoryIndex {
    /// Index served before the first successful sync
    pub fn empty() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            entries: BTreeMap::new(),
            generated: Utc::now(),
        }
    }

    pub fn chart_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn versions(&self, name: &str) -> Option<&[ChartVersion]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Highest version of a chart
    pub fn latest(&self, name: &str) -> Option<&ChartVersion> {
        self.entries.get(name).and_then(|versions| versions.first())
    }

    /// Look up an exact version; `"latest"` resolves to the highest one
    pub fn get(&self, name: &str, version: &str) -> Option<&ChartVersion> {
        if version == "latest" {
            return self.latest(name);
        }
        let wanted = SemVer::parse(version).ok();
        self.entries.get(name)?.iter().find(|entry| {
            entry.version == version
                || match (&wanted, SemVer::parse(&entry.version)) {
                    (Some(wanted), Ok(have)) => *wanted == have,
                    _ => false,
                }
        })
    }

    pub fn chart_count(&self) -> usize {
        self.entries.len()
    }

    pub fn version_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compare everything but the generation stamp
    pub fn same_content(&self, other: &Self) -> bool {
        self.api_version == other.api_version && self.entries == other.entries
    }
}

/// What a build indexed and what it had to skip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBuildReport {
    pub indexed: usize,
    pub provenance_files: usize,
    /// Objects skipped as malformed, one warning each
    pub skipped: Vec<RepoError>,
}

/// Derive `(name, version)` from a package file name
pub fn parse_package_file_name(file_name: &str) -> std::result::Result<(String, String), String> {
    let stem = file_name
        .strip_suffix(PACKAGE_SUFFIX)
        .ok_or_else(|| format!("'{}' is not a {} archive", file_name, PACKAGE_SUFFIX))?;

    for (pos, _) in stem.match_indices('-') {
        let (name, version) = (&stem[..pos], &stem[pos + 1..]);
        if name.is_empty() || SemVer::parse(version).is_err() {
            continue;
        }
        if !CHART_NAME_PATTERN.is_match(name) {
            return Err(format!("'{}' is not a valid chart name", name));
        }
        return Ok((name.to_string(), version.to_string()));
    }

    Err(format!(
        "cannot derive chart name and version from '{}'",
        file_name
    ))
}

/// Join the base URL and an object path with exactly one slash
///
/// An empty base URL yields a relative URL (the object path itself).
pub fn download_url(base_url: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    let base = base_url.trim_end_matches('/');
    if base.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn validate_base_url(base_url: &str) -> Result<()> {
    if base_url.is_empty() {
        return Ok(());
    }
    let rest = base_url
        .strip_prefix("https://")
        .or_else(|| base_url.strip_prefix("http://"))
        .ok_or_else(|| {
            RepoError::IndexBuildFailed(format!(
                "base URL '{}' must be absolute http(s)",
                base_url
            ))
        })?;
    if rest.trim_matches('/').is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(RepoError::IndexBuildFailed(format!(
            "base URL '{}' has no host",
            base_url
        )));
    }
    Ok(())
}

fn entry_for(object: &StorageObject, base_url: &str) -> Result<(ChartVersion, SemVer)> {
    let (name, version) = parse_package_file_name(object.file_name())
        .map_err(|reason| RepoError::malformed(&object.path, reason))?;
    let parsed = SemVer::parse(&version).map_err(|reason| RepoError::malformed(&object.path, reason))?;
    if object.etag.trim().is_empty() {
        return Err(RepoError::malformed(&object.path, "object has no content digest"));
    }

    Ok((
        ChartVersion {
            name,
            version,
            digest: object.etag.clone(),
            urls: vec![download_url(base_url, &object.path)],
            created: object.last_modified,
        },
        parsed,
    ))
}

/// Build an index from a snapshot
pub fn build_index(snapshot: &ObjectSnapshot, base_url: &str) -> Result<RepositoryIndex> {
    build_index_with_report(snapshot, base_url).map(|(index, _)| index)
}

/// Build an index and report skipped objects
pub fn build_index_with_report(
    snapshot: &ObjectSnapshot,
    base_url: &str,
) -> Result<(RepositoryIndex, IndexBuildReport)> {
    validate_base_url(base_url)?;

    let mut report = IndexBuildReport::default();
    let mut grouped: BTreeMap<String, Vec<(SemVer, ChartVersion)>> = BTreeMap::new();

    for object in snapshot.iter() {
        if object.is_provenance() {
            report.provenance_files += 1;
            continue;
        }
        if !object.is_package() {
            debug!(path = %object.path, "Ignoring non-package object");
            continue;
        }

        let (entry, parsed) = match entry_for(object, base_url) {
            Ok(built) => built,
            Err(e) => {
                warn!(path = %object.path, error = %e, "Skipping malformed artifact");
                report.skipped.push(e);
                continue;
            }
        };

        let versions = grouped.entry(entry.name.clone()).or_default();
        if let Some((_, existing)) = versions.iter().find(|(v, _)| *v == parsed) {
            let e = RepoError::malformed(
                &object.path,
                format!(
                    "duplicate of {} {} already indexed",
                    existing.name, existing.version
                ),
            );
            warn!(path = %object.path, error = %e, "Skipping duplicate chart version");
            report.skipped.push(e);
            continue;
        }
        versions.push((parsed, entry));
        report.indexed += 1;
    }

    let entries = grouped
        .into_iter()
        .map(|(name, mut versions)| {
            // 重复版本已被跳过，优先级之间不存在相等项
            versions.sort_by(|(va, _), (vb, _)| vb.cmp(va));
            (name, versions.into_iter().map(|(_, entry)| entry).collect())
        })
        .collect();

    Ok((
        RepositoryIndex {
            api_version: API_VERSION.to_string(),
            entries,
            generated: Utc::now(),
        },
        report,
    ))
}
