//! Legacy signed schema 1 manifests.
//!
//! Accepted for read and delete only; the payload is parsed just far enough to
//! recover layer references (`fsLayers[].blobSum`) so that deletes can enqueue
//! the right review work. Signatures are carried opaquely and never verified.
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifest {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

impl SignedManifest {
    /// Distinct layer digests referenced by this manifest. Schema 1 manifests
    /// routinely repeat a blobSum for empty layers; duplicates are collapsed.
    pub fn layer_digests(&self) -> Vec<Digest> {
        let mut seen = std::collections::HashSet::new();
        self.fs_layers
            .iter()
            .filter(|l| seen.insert(&l.blob_sum))
            .map(|l| l.blob_sum.clone())
            .collect()
    }
}
