//! Label and annotation keys recognized by the controller.
//!
//! These keys form the wire contract with the mesh installation and must stay
//! stable once a deployment depends on them.

/// Revision label. On namespaces the value is a revision tag name; on pods the
/// sidecar injector records the concrete control-plane revision here.
pub const REVISION_LABEL: &str = "mesh.rev";

/// Tag label carried by revision-tag admission webhooks.
pub const TAG_LABEL: &str = "mesh.tag";

/// App label identifying the mesh sidecar injector's webhooks.
pub const INJECTOR_APP_LABEL: &str = "app";

/// Expected value of [`INJECTOR_APP_LABEL`] on injector webhooks.
pub const INJECTOR_APP_VALUE: &str = "sidecar-injector";

/// Label written on pods whose sidecar runs an outdated revision. The value is
/// a unix-nanoseconds timestamp string.
pub const OUTDATED_AT_LABEL: &str = "fortsa.io/outdated-at";

/// Annotation patched onto a workload controller's pod template to trigger a
/// rolling restart. The value is an RFC 3339 timestamp.
pub const RESTARTED_AT_ANNOTATION: &str = "fortsa.io/restarted-at";

/// Namespace the mesh control plane runs in.
pub const CONTROL_PLANE_NAMESPACE: &str = "mesh-system";
