/// Failures raised by the pure domain code.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A Label Studio export lacks a field or keypoint the parsers need.
    #[error("Malformed annotation: {0}")]
    MalformedAnnotation(String),
}
