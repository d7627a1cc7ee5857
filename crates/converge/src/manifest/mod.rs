//! Desired-state model: resources, revisions and manifest parsing.

pub mod loader;
pub mod resource;

pub use loader::{is_manifest_path, ManifestFile, ManifestParser};
pub use resource::{
    template_hash, ConfigMapSpec, EndpointSpec, ManifestSet, ObjectMeta, Resource, ResourceKind,
    ResourceRef, Revision, WorkloadSpec, API_VERSION, OWNER_LABEL,
};
