//! NodeInfo 2.0/2.1 documents and the well-known discovery JRD

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use url::Url;

/// Schema URL prefix the well-known JRD keys links by.
pub const NODEINFO_SCHEMA_PREFIX: &str = "http://nodeinfo.diaspora.software/ns/schema/";

/// Supported NodeInfo schema versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeInfoVersion {
    /// Schema 2.0
    V2_0,
    /// Schema 2.1
    V2_1,
}

impl NodeInfoVersion {
    /// Parse the `<version>` path segment of `/nodeinfo/<version>`.
    pub fn from_path_segment(segment: &str) -> Option<NodeInfoVersion> {
        match segment {
            "2.0" => Some(NodeInfoVersion::V2_0),
            "2.1" => Some(NodeInfoVersion::V2_1),
            _ => None,
        }
    }

    /// The schema URL for this version.
    pub fn schema_url(self) -> String {
        format!("{NODEINFO_SCHEMA_PREFIX}{self}")
    }
}

impl Display for NodeInfoVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeInfoVersion::V2_0 => "2.0",
            NodeInfoVersion::V2_1 => "2.1",
        })
    }
}

/// A parsed semantic version with zero-defaults for missing components.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftwareVersion {
    /// Major component
    pub major: u64,
    /// Minor component, zero when absent
    pub minor: u64,
    /// Patch component, zero when absent
    pub patch: u64,
}

impl SoftwareVersion {
    /// Parse `1`, `1.2` or `1.2.3`; missing minor/patch default to zero.
    /// Build metadata and prerelease tags are ignored.
    pub fn parse(version: &str) -> Option<SoftwareVersion> {
        let version = version
            .split(|c| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        let mut parts = version.split('.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = match parts.next() {
            Some(part) => part.trim().parse().ok()?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(part) => part.trim().parse().ok()?,
            None => 0,
        };
        Some(SoftwareVersion {
            major,
            minor,
            patch,
        })
    }
}

impl Display for SoftwareVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for SoftwareVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SoftwareVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SoftwareVersion::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom("invalid software version"))
    }
}

/// The software block of a NodeInfo document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoSoftware {
    /// Canonical software name
    pub name: String,
    /// Software version
    pub version: SoftwareVersion,
    /// Source repository; serialized for 2.1 only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Url>,
    /// Project homepage; serialized for 2.1 only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<Url>,
}

/// The services block of a NodeInfo document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeInfoServices {
    /// Services this node can import from
    #[serde(default)]
    pub inbound: Vec<String>,
    /// Services this node can publish to
    #[serde(default)]
    pub outbound: Vec<String>,
}

/// User counts of a NodeInfo usage block.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsers {
    /// Total registered users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Users active in the last half year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_halfyear: Option<u64>,
    /// Users active in the last month
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_month: Option<u64>,
}

/// The usage block of a NodeInfo document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsage {
    /// User counts
    #[serde(default)]
    pub users: NodeInfoUsers,
    /// Posts on this node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_posts: Option<u64>,
    /// Comments on this node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_comments: Option<u64>,
}

/// A NodeInfo document as produced by the user's dispatcher.
///
/// Fields the dispatcher leaves out fall back to the schema defaults:
/// closed registrations, empty services, empty metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// The software running this node
    pub software: NodeInfoSoftware,
    /// Federation protocols; `activitypub` for nodes built on this crate
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    /// Third-party service connectivity
    #[serde(default)]
    pub services: NodeInfoServices,
    /// Whether signups are open
    #[serde(default)]
    pub open_registrations: bool,
    /// Usage statistics
    #[serde(default)]
    pub usage: NodeInfoUsage,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_protocols() -> Vec<String> {
    vec!["activitypub".to_string()]
}

impl NodeInfo {
    /// Render as a schema document of the requested version.
    ///
    /// 2.0 omits the repository/homepage fields; 2.1 includes them.
    pub fn to_document(&self, version: NodeInfoVersion) -> Value {
        let mut software = Map::new();
        software.insert("name".into(), Value::String(self.software.name.clone()));
        software.insert(
            "version".into(),
            Value::String(self.software.version.to_string()),
        );
        if version == NodeInfoVersion::V2_1 {
            if let Some(repository) = &self.software.repository {
                software.insert("repository".into(), Value::String(repository.to_string()));
            }
            if let Some(homepage) = &self.software.homepage {
                software.insert("homepage".into(), Value::String(homepage.to_string()));
            }
        }
        serde_json::json!({
            "version": version.to_string(),
            "software": software,
            "protocols": self.protocols,
            "services": self.services,
            "openRegistrations": self.open_registrations,
            "usage": self.usage,
            "metadata": self.metadata,
        })
    }
}

/// The `/.well-known/nodeinfo` JRD listing the documents we serve.
pub fn well_known_document(base: &Url, versions: &[NodeInfoVersion]) -> Value {
    let links: Vec<Value> = versions
        .iter()
        .filter_map(|version| {
            let href = base.join(&format!("/nodeinfo/{version}")).ok()?;
            Some(serde_json::json!({
                "rel": version.schema_url(),
                "href": href.to_string(),
            }))
        })
        .collect();
    serde_json::json!({ "links": links })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_software_version_defaults() {
        assert_eq!(
            SoftwareVersion::parse("1.2.3").unwrap(),
            SoftwareVersion { major: 1, minor: 2, patch: 3 }
        );
        assert_eq!(
            SoftwareVersion::parse("1.2").unwrap(),
            SoftwareVersion { major: 1, minor: 2, patch: 0 }
        );
        assert_eq!(
            SoftwareVersion::parse("2").unwrap(),
            SoftwareVersion { major: 2, minor: 0, patch: 0 }
        );
        assert_eq!(
            SoftwareVersion::parse("1.0.0-beta.2").unwrap(),
            SoftwareVersion { major: 1, minor: 0, patch: 0 }
        );
        assert!(SoftwareVersion::parse("not-a-version").is_none());
        assert_eq!(SoftwareVersion::parse("1.2.3").unwrap().to_string(), "1.2.3");
    }

    #[test]
    fn test_document_defaults() {
        let info: NodeInfo = serde_json::from_value(serde_json::json!({
            "software": {"name": "testnode", "version": "0.3"},
        }))
        .unwrap();
        assert!(!info.open_registrations);
        assert!(info.services.inbound.is_empty());
        assert!(info.metadata.is_empty());

        let doc = info.to_document(NodeInfoVersion::V2_0);
        assert_eq!(doc["version"], "2.0");
        assert_eq!(doc["software"]["version"], "0.3.0");
        assert_eq!(doc["openRegistrations"], false);
        assert_eq!(doc["services"]["inbound"], serde_json::json!([]));
        assert_eq!(doc["metadata"], serde_json::json!({}));
    }

    #[test]
    fn test_version_specific_fields() {
        let info = NodeInfo {
            software: NodeInfoSoftware {
                name: "testnode".to_string(),
                version: SoftwareVersion { major: 1, minor: 0, patch: 0 },
                repository: Some("https://example.com/src".parse().unwrap()),
                homepage: Some("https://example.com".parse().unwrap()),
            },
            protocols: default_protocols(),
            services: NodeInfoServices::default(),
            open_registrations: false,
            usage: NodeInfoUsage::default(),
            metadata: Map::new(),
        };
        let v20 = info.to_document(NodeInfoVersion::V2_0);
        assert!(v20["software"].get("repository").is_none());
        let v21 = info.to_document(NodeInfoVersion::V2_1);
        assert_eq!(v21["software"]["repository"], "https://example.com/src");
    }

    #[test]
    fn test_well_known_document() {
        let base = Url::parse("https://example.com/").unwrap();
        let doc = well_known_document(
            &base,
            &[NodeInfoVersion::V2_0, NodeInfoVersion::V2_1],
        );
        let links = doc["links"].as_array().unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(
            links[0]["rel"],
            "http://nodeinfo.diaspora.software/ns/schema/2.0"
        );
        assert_eq!(links[1]["href"], "https://example.com/nodeinfo/2.1");
    }

    #[test]
    fn test_version_path_segments() {
        assert_eq!(
            NodeInfoVersion::from_path_segment("2.0"),
            Some(NodeInfoVersion::V2_0)
        );
        assert_eq!(
            NodeInfoVersion::from_path_segment("2.1"),
            Some(NodeInfoVersion::V2_1)
        );
        assert_eq!(NodeInfoVersion::from_path_segment("1.0"), None);
    }
}
