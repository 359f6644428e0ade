/// Error types for Linux structure discovery.
#[derive(thiserror::Error, Debug)]
pub enum LinuxError {
    /// Corrupted struct.
    #[error("Corrupted struct: {0}")]
    CorruptedStruct(&'static str),

    /// A profile could not be parsed.
    #[error("Invalid profile: {0}")]
    Profile(#[from] serde_json::Error),

    /// No built-in profile has the requested name.
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
}

impl From<LinuxError> for vmsnap_core::SnapError {
    fn from(value: LinuxError) -> Self {
        vmsnap_core::SnapError::Os(value.into())
    }
}
