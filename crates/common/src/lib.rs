use sha2::{Digest, Sha256};

pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_VERSION: &str = "app.kubernetes.io/version";
pub const LABEL_CONTROL_PLANE: &str = "control-plane";
pub const LABEL_APP: &str = "app";
pub const PART_OF_VALUE: &str = "flux";
pub const CONTROL_PLANE_VALUE: &str = "controller";
pub const COMPONENTS_FILENAME: &str = "gotk-components.yaml";
pub const IDENTITY_PREFIX: &str = "sha256:";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-addressed fingerprint of rendered manifest text.
pub fn content_identity(content: &str) -> String {
    format!("{}{}", IDENTITY_PREFIX, sha256_hex(content.as_bytes()))
}

pub fn identity_short(identity: &str) -> String {
    let trimmed = identity.strip_prefix(IDENTITY_PREFIX).unwrap_or(identity);
    trimmed.chars().take(8).collect()
}

/// Repository path the components manifest is committed to.
///
/// Plain concatenation: neither segment is trimmed or normalised, so the
/// result is a pure function of its inputs.
pub fn install_path(target_path: &str, namespace: &str) -> String {
    format!("{}/{}/{}", target_path, namespace, COMPONENTS_FILENAME)
}
