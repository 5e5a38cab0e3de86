use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Format tag shared by every repository document.
pub const DOC_VERSION: &str = "1";

pub const PACKAGES_RESOURCE: &str = "packages";
pub const VERSIONS_RESOURCE: &str = "versions";
pub const CURRENT_RESOURCE: &str = "current";

/// A named snapshot of the distributed tree. Identity is the id; the
/// description is display-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    #[serde(rename = "revision")]
    pub id: String,
    #[serde(default)]
    pub description: String,
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Revision {}

impl Revision {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// An edge in the revision graph: a data blob plus metadata transforming
/// `from` into `to`. An empty `from` is a complete install, usable from any
/// starting point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub from: String,
    pub to: String,
    #[serde(with = "string_u64")]
    pub size: u64,
}

impl Package {
    pub fn is_complete(&self) -> bool {
        self.from.is_empty()
    }

    /// Canonical package name, derived from the endpoints.
    pub fn name(&self) -> String {
        if self.is_complete() {
            format!("complete_{}", self.to)
        } else {
            format!("patch{}_{}", self.from, self.to)
        }
    }

    pub fn data_resource(&self) -> String {
        self.name()
    }

    pub fn metadata_resource(&self) -> String {
        format!("{}.metadata", self.name())
    }

    /// Recover the endpoints from a canonical package name, as used by
    /// `addpackage`. Revision ids must not contain `_`; the name format does
    /// not survive them.
    pub fn parse_name(name: &str) -> Result<(String, String)> {
        if let Some(to) = name.strip_prefix("complete_") {
            if !to.is_empty() {
                return Ok((String::new(), to.to_string()));
            }
        } else if let Some(rest) = name.strip_prefix("patch") {
            if let Some((from, to)) = rest.split_once('_') {
                if !from.is_empty() && !to.is_empty() {
                    return Ok((from.to_string(), to.to_string()));
                }
            }
        }
        Err(Error::PackageName(name.to_string()))
    }
}

/// The `packages` index document.
#[derive(Debug, Serialize, Deserialize)]
pub struct PackagesFile {
    pub version: String,
    pub packages: Vec<Package>,
}

/// The `versions` index document.
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionsFile {
    pub version: String,
    pub versions: Vec<Revision>,
}

/// The `current` pointer document.
#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentFile {
    pub version: String,
    pub current: Revision,
}

fn check_doc_version(resource: &str, found: &str) -> Result<()> {
    if found != DOC_VERSION {
        return Err(Error::UnsupportedVersion {
            resource: resource.to_string(),
            found: found.to_string(),
            expected: DOC_VERSION.to_string(),
        });
    }
    Ok(())
}

fn parse_json<T: serde::de::DeserializeOwned>(resource: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|source| Error::Json {
        resource: resource.to_string(),
        source,
    })
}

/// Parse the `packages` index. Duplicate `(from, to)` pairs are dropped,
/// first occurrence wins.
pub fn parse_packages(bytes: &[u8]) -> Result<Vec<Package>> {
    let doc: PackagesFile = parse_json(PACKAGES_RESOURCE, bytes)?;
    check_doc_version(PACKAGES_RESOURCE, &doc.version)?;
    Ok(dedup_packages(doc.packages))
}

/// Parse the `versions` index. Duplicate revision ids are dropped, first
/// occurrence wins.
pub fn parse_versions(bytes: &[u8]) -> Result<Vec<Revision>> {
    let doc: VersionsFile = parse_json(VERSIONS_RESOURCE, bytes)?;
    check_doc_version(VERSIONS_RESOURCE, &doc.version)?;
    let mut seen = HashSet::new();
    Ok(doc
        .versions
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect())
}

/// Parse the `current` pointer.
pub fn parse_current(bytes: &[u8]) -> Result<Revision> {
    let doc: CurrentFile = parse_json(CURRENT_RESOURCE, bytes)?;
    check_doc_version(CURRENT_RESOURCE, &doc.version)?;
    Ok(doc.current)
}

pub fn dedup_packages(packages: Vec<Package>) -> Vec<Package> {
    let mut seen = HashSet::new();
    packages
        .into_iter()
        .filter(|p| seen.insert((p.from.clone(), p.to.clone())))
        .collect()
}

/// `size` travels as a JSON string in the `packages` index.
pub mod string_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_names() {
        let complete = Package {
            from: String::new(),
            to: "3".into(),
            size: 10,
        };
        assert_eq!(complete.name(), "complete_3");
        assert_eq!(complete.metadata_resource(), "complete_3.metadata");

        let patch = Package {
            from: "2".into(),
            to: "3".into(),
            size: 10,
        };
        assert_eq!(patch.name(), "patch2_3");
        assert_eq!(patch.data_resource(), "patch2_3");
    }

    #[test]
    fn test_parse_name_roundtrip() {
        assert_eq!(
            Package::parse_name("complete_7").unwrap(),
            (String::new(), "7".into())
        );
        assert_eq!(
            Package::parse_name("patch1_2").unwrap(),
            ("1".into(), "2".into())
        );
        assert!(Package::parse_name("bogus").is_err());
        assert!(Package::parse_name("complete_").is_err());
    }

    #[test]
    fn test_packages_size_as_string() {
        let json = br#"{"version":"1","packages":[{"from":"1","to":"2","size":"4096"}]}"#;
        let packages = parse_packages(json).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].size, 4096);

        let doc = PackagesFile {
            version: DOC_VERSION.into(),
            packages,
        };
        let out = serde_json::to_string(&doc).unwrap();
        assert!(out.contains(r#""size":"4096""#));
    }

    #[test]
    fn test_packages_dedup() {
        let json = br#"{"version":"1","packages":[
            {"from":"1","to":"2","size":"10"},
            {"from":"1","to":"2","size":"99"},
            {"from":"","to":"2","size":"50"}]}"#;
        let packages = parse_packages(json).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].size, 10);
    }

    #[test]
    fn test_unsupported_doc_version() {
        let json = br#"{"version":"9","packages":[]}"#;
        assert!(matches!(
            parse_packages(json),
            Err(Error::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_revision_equality_is_id_only() {
        let a = Revision::new("1", "first");
        let b = Revision::new("1", "relabeled");
        assert_eq!(a, b);
    }
}
