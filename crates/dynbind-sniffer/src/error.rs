use thiserror::Error;

/// Errors raised while sniffing a library.
#[derive(Debug, Error)]
pub enum SniffError {
    /// `nm` could not be spawned or exited with an error.
    #[error("command 'nm' execution failed: {0}")]
    CommandFailed(String),

    /// A `T` line did not have the `address type name` shape.
    #[error("malformed nm line: expected 3 chunks, got {chunks}: {line:?}")]
    MalformedLine { line: String, chunks: usize },
}
