//! Container image reference handling.

/// Image a container was created from, as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetails {
    /// Reference the container was created with (e.g. `redis:7`).
    pub reference: String,
    /// Runtime-internal image id (`sha256:…`).
    pub id: String,
}

/// Normalize an image reference so equal images compare equal.
///
/// Docker treats an untagged reference as `:latest`. A colon in a registry
/// host (`localhost:5000/app`) is not a tag, and digest references are left
/// alone since they already pin an exact image.
pub fn normalize(reference: &str) -> String {
    let reference = reference.trim();
    if reference.contains('@') {
        return reference.to_string();
    }
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if last_segment.contains(':') {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}
