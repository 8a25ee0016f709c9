use super::mediatype;
use super::{Descriptor, ImageManifest, ManifestList};
use crate::errors::{Error, Result};

/// Child descriptors of a manifest list, split by what they point at.
///
/// Concatenating `manifests` and `blobs` in either order reproduces the list's
/// descriptor multiset; nothing is added, dropped, or duplicated.
#[derive(Debug, Default)]
pub struct ReferencePartition {
    pub manifests: Vec<Descriptor>,
    pub blobs: Vec<Descriptor>,
}

pub fn partition_references(list: &ManifestList) -> ReferencePartition {
    let mut partition = ReferencePartition::default();
    for desc in &list.manifests {
        if mediatype::is_manifest(&desc.media_type) {
            partition.manifests.push(desc.clone());
        } else {
            partition.blobs.push(desc.clone());
        }
    }
    partition
}

/// True when the index is, in practice, a Buildkit cache container: at least
/// one non-manifest child carrying the cacheconfig media type.
pub fn likely_buildkit_cache(list: &ManifestList) -> bool {
    partition_references(list)
        .blobs
        .iter()
        .any(|d| d.media_type == mediatype::BUILDKIT_CACHE_CONFIG)
}

/// Reinterpret a Buildkit cache index as an OCI image manifest: the cacheconfig
/// blob becomes the config, every other blob becomes a layer, in input order.
pub fn image_manifest_from_buildkit_index(list: &ManifestList) -> Result<ImageManifest> {
    let mut config: Option<Descriptor> = None;
    let mut layers: Vec<Descriptor> = Vec::with_capacity(list.manifests.len());

    for desc in &list.manifests {
        if mediatype::is_manifest(&desc.media_type) {
            return Err(Error::BuildkitIndexInvalid(
                "index child is a manifest, not a blob",
            ));
        }
        if desc.media_type == mediatype::BUILDKIT_CACHE_CONFIG {
            config = Some(desc.clone());
        } else {
            layers.push(desc.clone());
        }
    }

    let config = config.ok_or(Error::BuildkitIndexInvalid("no cache config descriptor"))?;
    if layers.is_empty() {
        return Err(Error::BuildkitIndexInvalid("no layer descriptors"));
    }

    Ok(ImageManifest {
        schema_version: 2,
        media_type: Some(mediatype::OCI_MANIFEST.to_string()),
        config,
        layers,
    })
}

#[cfg(test)]
mod test {
    use super::super::test::descriptor;
    use super::*;

    fn list(children: Vec<Descriptor>) -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: Some(mediatype::OCI_INDEX.to_string()),
            manifests: children,
        }
    }

    #[test]
    fn partition_is_exact() {
        let children = vec![
            descriptor(mediatype::OCI_MANIFEST, b"m1", 10),
            descriptor(mediatype::BUILDKIT_CACHE_CONFIG, b"cfg", 20),
            descriptor(mediatype::DOCKER_MANIFEST, b"m2", 30),
            descriptor("application/vnd.oci.image.layer.v1.tar+gzip", b"l1", 40),
        ];
        let l = list(children.clone());
        let p = partition_references(&l);

        assert_eq!(p.manifests.len(), 2);
        assert_eq!(p.blobs.len(), 2);

        // either concatenation order reproduces the original reference set
        for ordering in [
            [p.manifests.clone(), p.blobs.clone()].concat(),
            [p.blobs.clone(), p.manifests.clone()].concat(),
        ] {
            let mut sorted: Vec<_> = ordering.iter().map(|d| d.digest.clone()).collect();
            sorted.sort_by_key(|d| d.encoded().to_string());
            let mut expected: Vec<_> = children.iter().map(|d| d.digest.clone()).collect();
            expected.sort_by_key(|d| d.encoded().to_string());
            assert_eq!(sorted, expected);
        }
    }

    #[test]
    fn buildkit_detection_needs_the_sentinel() {
        let with = list(vec![
            descriptor(mediatype::BUILDKIT_CACHE_CONFIG, b"cfg", 1),
            descriptor("application/vnd.oci.image.layer.v1.tar+gzip", b"l", 2),
        ]);
        assert!(likely_buildkit_cache(&with));

        let without = list(vec![descriptor(
            "application/vnd.oci.image.layer.v1.tar+gzip",
            b"l",
            2,
        )]);
        assert!(!likely_buildkit_cache(&without));

        // a manifest child with the same digest does not count as a blob
        let manifests_only = list(vec![descriptor(mediatype::OCI_MANIFEST, b"cfg", 1)]);
        assert!(!likely_buildkit_cache(&manifests_only));
    }

    #[test]
    fn buildkit_conversion_roundtrip() {
        let cfg = descriptor(mediatype::BUILDKIT_CACHE_CONFIG, b"cfg", 9);
        let l1 = descriptor("application/vnd.buildkit.cachelayer.v0", b"l1", 1);
        let l2 = descriptor("application/vnd.buildkit.cachelayer.v0", b"l2", 2);
        let l = list(vec![l1.clone(), cfg.clone(), l2.clone()]);

        let m = image_manifest_from_buildkit_index(&l).unwrap();
        assert_eq!(m.schema_version, 2);
        assert_eq!(m.media_type.as_deref(), Some(mediatype::OCI_MANIFEST));
        assert_eq!(m.config, cfg);
        assert_eq!(m.layers, vec![l1, l2]);
    }

    #[test]
    fn buildkit_conversion_failures() {
        // no config
        let l = list(vec![descriptor("application/vnd.buildkit.cachelayer.v0", b"l", 1)]);
        assert!(image_manifest_from_buildkit_index(&l).is_err());

        // no layers
        let l = list(vec![descriptor(mediatype::BUILDKIT_CACHE_CONFIG, b"cfg", 1)]);
        assert!(image_manifest_from_buildkit_index(&l).is_err());

        // manifest child
        let l = list(vec![
            descriptor(mediatype::BUILDKIT_CACHE_CONFIG, b"cfg", 1),
            descriptor(mediatype::OCI_MANIFEST, b"m", 2),
        ]);
        assert!(image_manifest_from_buildkit_index(&l).is_err());
    }
}
