use regex::Regex;
use url::Url;

use super::mediatype;
use super::{Descriptor, ImageManifest, ManifestList};
use crate::errors::{Error, Result, VerificationError, VerificationErrors};

/// Policy knobs for manifest validation.
///
/// Dependency existence is checked by the caller (it requires store access);
/// everything here is evaluated against the payload alone.
#[derive(Debug, Default, Clone)]
pub struct ValidatorOptions {
    /// Skip config/layer/child existence verification entirely.
    pub skip_dependency_verification: bool,
    /// Maximum number of references (config + layers, or list children).
    /// `None` disables the limit.
    pub reference_limit: Option<usize>,
    /// Foreign-layer URLs must match this pattern when set.
    pub url_allow: Option<Regex>,
    /// Foreign-layer URLs must not match this pattern when set.
    pub url_deny: Option<Regex>,
}

pub fn validate_schema_version(version: i32) -> Result<()> {
    if version != 2 {
        return Err(Error::UnsupportedSchemaVersion(version));
    }
    Ok(())
}

pub fn check_reference_limit(count: usize, opts: &ValidatorOptions) -> Result<()> {
    match opts.reference_limit {
        Some(limit) if count > limit => Err(Error::ReferenceLimitExceeded { limit, count }),
        _ => Ok(()),
    }
}

/// Payload-level checks for a single-image manifest: schema version, reference
/// limit, and foreign-layer URL policy. Missing-dependency checks are appended
/// to `errs` by the caller.
pub fn validate_image_manifest(
    manifest: &ImageManifest,
    opts: &ValidatorOptions,
    errs: &mut VerificationErrors,
) -> Result<()> {
    validate_schema_version(manifest.schema_version)?;
    check_reference_limit(1 + manifest.layers.len(), opts)?;
    for layer in &manifest.layers {
        validate_layer_urls(layer, opts, errs);
    }
    Ok(())
}

pub fn validate_manifest_list(list: &ManifestList, opts: &ValidatorOptions) -> Result<()> {
    validate_schema_version(list.schema_version)?;
    check_reference_limit(list.manifests.len(), opts)
}

/// Apply the URL policy to one layer descriptor.
///
/// Layers with a distribution-restricted media type must carry at least one
/// acceptable URL; regular layers may carry URLs without restriction.
pub fn validate_layer_urls(
    layer: &Descriptor,
    opts: &ValidatorOptions,
    errs: &mut VerificationErrors,
) {
    if !mediatype::is_distributable_restricted(&layer.media_type) {
        return;
    }
    let urls = layer.urls.as_deref().unwrap_or_default();
    if urls.is_empty() {
        errs.push(VerificationError::MissingLayerUrls(layer.digest.clone()));
        return;
    }
    for url in urls {
        if let Some(reason) = reject_reason(url, opts) {
            errs.push(VerificationError::LayerUrlRejected {
                digest: layer.digest.clone(),
                url: url.clone(),
                reason,
            });
        }
    }
}

fn reject_reason(url: &str, opts: &ValidatorOptions) -> Option<&'static str> {
    if url.is_empty() {
        return Some("empty URL");
    }
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return Some("unparseable URL"),
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return Some("scheme must be http or https");
    }
    if parsed.fragment().is_some() {
        return Some("URL must not carry a fragment");
    }
    if let Some(allow) = &opts.url_allow {
        if !allow.is_match(url) {
            return Some("URL does not match the allow pattern");
        }
    }
    if let Some(deny) = &opts.url_deny {
        if deny.is_match(url) {
            return Some("URL matches the deny pattern");
        }
    }
    None
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::super::test::descriptor;
    use super::*;
    use crate::digest::Digest;

    fn foreign_layer(urls: Option<Vec<&str>>) -> Descriptor {
        let mut d = descriptor(mediatype::DOCKER_FOREIGN_LAYER, b"foreign", 100);
        d.urls = urls.map(|v| v.into_iter().map(String::from).collect());
        d
    }

    #[rstest]
    #[case::plain_https(vec!["https://example.com/layer.tar.gz"], true)]
    #[case::plain_http(vec!["http://example.com/layer.tar.gz"], true)]
    #[case::ftp(vec!["ftp://example.com/layer.tar.gz"], false)]
    #[case::fragment(vec!["https://example.com/layer.tar.gz#frag"], false)]
    #[case::empty_string(vec![""], false)]
    #[case::garbage(vec!["::not a url::"], false)]
    #[case::one_bad_among_good(vec!["https://example.com/a", "ftp://example.com/b"], false)]
    fn foreign_layer_urls(#[case] urls: Vec<&str>, #[case] ok: bool) {
        let mut errs = VerificationErrors::default();
        validate_layer_urls(&foreign_layer(Some(urls)), &ValidatorOptions::default(), &mut errs);
        assert_eq!(errs.is_empty(), ok);
    }

    #[test]
    fn foreign_layer_requires_urls() {
        for urls in [None, Some(vec![])] {
            let mut errs = VerificationErrors::default();
            validate_layer_urls(&foreign_layer(urls), &ValidatorOptions::default(), &mut errs);
            assert!(matches!(
                errs.0.as_slice(),
                [VerificationError::MissingLayerUrls(_)]
            ));
        }
    }

    #[test]
    fn regular_layer_urls_are_unrestricted() {
        let mut d = descriptor("application/vnd.docker.image.rootfs.diff.tar.gzip", b"l", 1);
        d.urls = Some(vec!["ftp://anything.goes/here#frag".to_string()]);
        let mut errs = VerificationErrors::default();
        validate_layer_urls(&d, &ValidatorOptions::default(), &mut errs);
        assert!(errs.is_empty());
    }

    #[test]
    fn allow_and_deny_patterns() {
        let opts = ValidatorOptions {
            url_allow: Some(Regex::new(r"^https://mirror\.internal/").unwrap()),
            url_deny: Some(Regex::new(r"/secret/").unwrap()),
            ..Default::default()
        };

        let mut errs = VerificationErrors::default();
        validate_layer_urls(
            &foreign_layer(Some(vec!["https://mirror.internal/layers/a"])),
            &opts,
            &mut errs,
        );
        assert!(errs.is_empty());

        for rejected in [
            "https://elsewhere.example/layers/a",
            "https://mirror.internal/secret/a",
        ] {
            let mut errs = VerificationErrors::default();
            validate_layer_urls(&foreign_layer(Some(vec![rejected])), &opts, &mut errs);
            assert!(!errs.is_empty(), "{rejected} should be rejected");
        }
    }

    #[test]
    fn schema_version_must_be_two() {
        assert!(validate_schema_version(2).is_ok());
        for v in [0, 1, 3] {
            assert!(matches!(
                validate_schema_version(v),
                Err(Error::UnsupportedSchemaVersion(_))
            ));
        }
    }

    #[test]
    fn reference_limit() {
        let opts = ValidatorOptions {
            reference_limit: Some(3),
            ..Default::default()
        };
        assert!(check_reference_limit(3, &opts).is_ok());
        assert!(matches!(
            check_reference_limit(4, &opts),
            Err(Error::ReferenceLimitExceeded { limit: 3, count: 4 })
        ));
        assert!(check_reference_limit(100, &ValidatorOptions::default()).is_ok());
    }

    #[test]
    fn aggregate_lists_every_failure() {
        let mut errs = VerificationErrors::default();
        let d1 = Digest::from_bytes(b"missing-1");
        let d2 = Digest::from_bytes(b"missing-2");
        errs.push(VerificationError::BlobUnknown(d1.clone()));
        errs.push(VerificationError::BlobUnknown(d2.clone()));
        let err = errs.into_result().unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&d1.to_string()));
        assert!(message.contains(&d2.to_string()));
    }
}
