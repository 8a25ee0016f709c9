// Maps registry entities to object-store paths.
//
// The layout under the root is:
//
//	<root>/blobs
//	├── <algorithm>
//	│   └── <first two hex characters of digest>
//	│       └── <hex digest>
//	│           └── data
//	<root>/repositories
//	└── <repository path>
//	    ├── _manifests
//	    │   ├── revisions
//	    │   │   └── <algorithm>/<hex digest>/link
//	    │   └── tags
//	    │       └── <tag>/current/link
//	    ├── _layers
//	    │   └── <algorithm>/<hex digest>/link
//	    └── _uploads
//	        └── <uuid>/{data,startedat,hashstates/<algorithm>/<offset>}
//
// Bulk content lives only in the content-addressable blobs tree; everything
// under repositories/ is links (digest text) or upload scratch space. Offline
// deployments and the mark-and-sweep pass operate on this layout directly.

use stevedore_core::Digest;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct PathBuilder {
    root: String,
}

impl PathBuilder {
    /// Root must be an absolute UNIX-style path; a bare "/" root collapses to
    /// the empty prefix.
    pub fn new(root: &str) -> Self {
        PathBuilder {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    /// `<root>/blobs`
    pub fn blobs_root(&self) -> String {
        format!("{}/blobs", self.root)
    }

    /// `<root>/blobs/<alg>/<hex[0:2]>/<hex>`
    pub fn blob_path(&self, digest: &Digest) -> String {
        format!(
            "{}/{}/{}/{}",
            self.blobs_root(),
            digest.algorithm(),
            digest.split_prefix(),
            digest.encoded(),
        )
    }

    /// `<root>/blobs/<alg>/<hex[0:2]>/<hex>/data`
    pub fn blob_data_path(&self, digest: &Digest) -> String {
        format!("{}/data", self.blob_path(digest))
    }

    /// `<root>/repositories`
    pub fn repositories_root(&self) -> String {
        format!("{}/repositories", self.root)
    }

    /// `<root>/repositories/<path>/_manifests`
    pub fn manifests_path(&self, repository: &str) -> String {
        format!("{}/{}/_manifests", self.repositories_root(), repository)
    }

    /// `<root>/repositories/<path>/_manifests/revisions`
    pub fn manifest_revisions_path(&self, repository: &str) -> String {
        format!("{}/revisions", self.manifests_path(repository))
    }

    /// `<root>/repositories/<path>/_manifests/revisions/<alg>/<hex>/link`
    pub fn manifest_revision_link_path(&self, repository: &str, digest: &Digest) -> String {
        format!(
            "{}/{}/{}/link",
            self.manifest_revisions_path(repository),
            digest.algorithm(),
            digest.encoded(),
        )
    }

    /// `<root>/repositories/<path>/_manifests/tags`
    pub fn tags_path(&self, repository: &str) -> String {
        format!("{}/tags", self.manifests_path(repository))
    }

    /// `<root>/repositories/<path>/_manifests/tags/<name>/current/link`
    pub fn tag_current_link_path(&self, repository: &str, tag: &str) -> String {
        format!("{}/{}/current/link", self.tags_path(repository), tag)
    }

    /// `<root>/repositories/<path>/_layers/<alg>/<hex>/link`
    pub fn layer_link_path(&self, repository: &str, digest: &Digest) -> String {
        format!(
            "{}/{}/_layers/{}/{}/link",
            self.repositories_root(),
            repository,
            digest.algorithm(),
            digest.encoded(),
        )
    }

    /// `<root>/repositories/<path>/_uploads/<uuid>`
    pub fn upload_path(&self, repository: &str, id: &Uuid) -> String {
        format!("{}/{}/_uploads/{}", self.repositories_root(), repository, id)
    }

    /// `<root>/repositories/<path>/_uploads/<uuid>/data`
    pub fn upload_data_path(&self, repository: &str, id: &Uuid) -> String {
        format!("{}/data", self.upload_path(repository, id))
    }

    /// `<root>/repositories/<path>/_uploads/<uuid>/startedat`
    pub fn upload_started_at_path(&self, repository: &str, id: &Uuid) -> String {
        format!("{}/startedat", self.upload_path(repository, id))
    }

    /// `<root>/repositories/<path>/_uploads/<uuid>/hashstates/<alg>/<offset>`
    pub fn upload_hash_state_path(
        &self,
        repository: &str,
        id: &Uuid,
        algorithm: stevedore_core::Algorithm,
        offset: u64,
    ) -> String {
        format!(
            "{}/hashstates/{}/{}",
            self.upload_path(repository, id),
            algorithm,
            offset
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_is_bit_exact() {
        let pb = PathBuilder::new("/registry");
        let digest = Digest::from_bytes(b"content");
        let hex = digest.encoded();
        let prefix = &hex[..2];

        assert_eq!(
            pb.blob_data_path(&digest),
            format!("/registry/blobs/sha256/{prefix}/{hex}/data")
        );
        assert_eq!(
            pb.manifest_revision_link_path("app/api", &digest),
            format!("/registry/repositories/app/api/_manifests/revisions/sha256/{hex}/link")
        );
        assert_eq!(
            pb.tag_current_link_path("app/api", "latest"),
            "/registry/repositories/app/api/_manifests/tags/latest/current/link"
        );
        assert_eq!(
            pb.layer_link_path("app/api", &digest),
            format!("/registry/repositories/app/api/_layers/sha256/{hex}/link")
        );

        let id = Uuid::new_v4();
        assert_eq!(
            pb.upload_data_path("app/api", &id),
            format!("/registry/repositories/app/api/_uploads/{id}/data")
        );
        assert_eq!(
            pb.upload_started_at_path("app/api", &id),
            format!("/registry/repositories/app/api/_uploads/{id}/startedat")
        );
        assert_eq!(
            pb.upload_hash_state_path("app/api", &id, stevedore_core::Algorithm::Sha256, 42),
            format!("/registry/repositories/app/api/_uploads/{id}/hashstates/sha256/42")
        );
    }

    #[test]
    fn root_slash_normalization() {
        let pb = PathBuilder::new("/");
        let digest = Digest::from_bytes(b"x");
        assert!(pb.blob_data_path(&digest).starts_with("/blobs/sha256/"));
    }
}
