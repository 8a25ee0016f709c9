//! Typed manifest payloads for the supported media types.
//!
//! A registry never rewrites manifest content: the payload bytes received on
//! push are the payload bytes served on pull, and the digest is computed over
//! exactly those bytes. The types here are a parsed *view* used for validation
//! and reference tracking.
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::errors::{Error, Result};

pub mod references;
pub mod schema1;
pub mod validation;

pub use references::{
    image_manifest_from_buildkit_index, likely_buildkit_cache, partition_references,
    ReferencePartition,
};
pub use schema1::SignedManifest;

pub mod mediatype {
    //! Canonical media type strings handled by the registry core.

    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const SIGNED_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const SCHEMA1_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v1+json";

    pub const DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

    /// Sentinel that marks an OCI index as a Buildkit cache container.
    pub const BUILDKIT_CACHE_CONFIG: &str = "application/vnd.buildkit.cacheconfig.v0";

    pub const DOCKER_FOREIGN_LAYER: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
    const OCI_NONDISTRIBUTABLE_PREFIX: &str = "application/vnd.oci.image.layer.nondistributable.";

    /// True for media types that name another manifest rather than a blob.
    pub fn is_manifest(media_type: &str) -> bool {
        matches!(
            media_type,
            DOCKER_MANIFEST | DOCKER_MANIFEST_LIST | OCI_MANIFEST | OCI_INDEX | SIGNED_MANIFEST
                | SCHEMA1_MANIFEST
        )
    }

    pub fn is_list(media_type: &str) -> bool {
        matches!(media_type, DOCKER_MANIFEST_LIST | OCI_INDEX)
    }

    /// Layers of these types are hosted outside the registry and must carry
    /// URLs instead of registry-local content.
    pub fn is_distributable_restricted(media_type: &str) -> bool {
        media_type == DOCKER_FOREIGN_LAYER || media_type.starts_with(OCI_NONDISTRIBUTABLE_PREFIX)
    }
}

/// Reference to a piece of content, as embedded in a manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

/// Docker image manifest schema 2 or OCI image manifest; the media type field
/// tells the two apart.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Config descriptor followed by the layer descriptors, in payload order.
    pub fn references(&self) -> Vec<&Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter()).collect()
    }
}

/// Docker manifest list v2 or OCI image index.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// Reference to a manifest within a repository: either its digest or a tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestRef {
    Digest(Digest),
    Tag(String),
}

impl std::str::FromStr for ManifestRef {
    type Err = Error;

    /// Digests win: anything that parses as `alg:hex` is a digest reference,
    /// everything else must be a valid tag name.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(digest) = Digest::try_from(s) {
            return Ok(Self::Digest(digest));
        }
        crate::names::validate_tag(s)?;
        Ok(Self::Tag(s.to_string()))
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ManifestRef::Digest(d) => write!(f, "{d}"),
            ManifestRef::Tag(t) => write!(f, "{t}"),
        }
    }
}

/// A manifest payload parsed according to its declared media type.
#[derive(Clone, Debug)]
pub enum ManifestPayload {
    Image(ImageManifest),
    List(ManifestList),
    Signed(SignedManifest),
}

impl ManifestPayload {
    /// Parse `bytes` as the given media type.
    ///
    /// An absent media type field inside the payload is backfilled from the
    /// declared type; a conflicting one is rejected.
    pub fn parse(media_type: &str, bytes: &[u8]) -> Result<Self> {
        match media_type {
            mediatype::DOCKER_MANIFEST | mediatype::OCI_MANIFEST => {
                let mut m: ImageManifest = serde_json::from_slice(bytes)?;
                match m.media_type.as_deref() {
                    None => m.media_type = Some(media_type.to_string()),
                    Some(mt) if mt == media_type => {}
                    Some(mt) => return Err(Error::UnknownMediaType(mt.to_string())),
                }
                Ok(ManifestPayload::Image(m))
            }
            mediatype::DOCKER_MANIFEST_LIST | mediatype::OCI_INDEX => {
                let mut l: ManifestList = serde_json::from_slice(bytes)?;
                match l.media_type.as_deref() {
                    None => l.media_type = Some(media_type.to_string()),
                    Some(mt) if mt == media_type => {}
                    Some(mt) => return Err(Error::UnknownMediaType(mt.to_string())),
                }
                Ok(ManifestPayload::List(l))
            }
            mediatype::SIGNED_MANIFEST | mediatype::SCHEMA1_MANIFEST => {
                Ok(ManifestPayload::Signed(serde_json::from_slice(bytes)?))
            }
            other => Err(Error::UnknownMediaType(other.to_string())),
        }
    }

    /// Parse a payload whose media type is not known out of band, as happens
    /// when reading manifests back out of content-addressed storage. The
    /// document shape decides: `manifests` means a list, `fsLayers` means a
    /// legacy signed manifest, `config` means an image manifest.
    pub fn detect(bytes: &[u8]) -> Result<Self> {
        let probe: serde_json::Value = serde_json::from_slice(bytes)?;
        if probe.get("manifests").is_some() {
            return Ok(ManifestPayload::List(serde_json::from_slice(bytes)?));
        }
        if probe.get("fsLayers").is_some() {
            return Ok(ManifestPayload::Signed(serde_json::from_slice(bytes)?));
        }
        if probe.get("config").is_some() {
            return Ok(ManifestPayload::Image(serde_json::from_slice(bytes)?));
        }
        Err(Error::UnknownMediaType("<undetectable payload>".to_string()))
    }

    pub fn media_type(&self) -> &str {
        match self {
            ManifestPayload::Image(m) => m
                .media_type
                .as_deref()
                .unwrap_or(mediatype::DOCKER_MANIFEST),
            ManifestPayload::List(l) => l.media_type.as_deref().unwrap_or(mediatype::OCI_INDEX),
            ManifestPayload::Signed(_) => mediatype::SIGNED_MANIFEST,
        }
    }

    pub fn schema_version(&self) -> i32 {
        match self {
            ManifestPayload::Image(m) => m.schema_version,
            ManifestPayload::List(l) => l.schema_version,
            ManifestPayload::Signed(s) => s.schema_version,
        }
    }

    pub fn config(&self) -> Option<&Descriptor> {
        match self {
            ManifestPayload::Image(m) => Some(&m.config),
            _ => None,
        }
    }
}
