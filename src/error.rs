use thiserror::Error;

/// Errors raised by the ingestion pipeline.
///
/// Row-level problems (`Parse`) are absorbed by the batch transform and routed
/// to the rejected-records output; everything else aborts the invocation.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Parse error at row {row}: {reason}")]
    Parse { row: usize, reason: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Notify error: {0}")]
    Notify(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EtlError {
    /// True for failures of the storage layer, including encode/decode errors
    /// surfaced while reading or writing objects.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            EtlError::Storage(_)
                | EtlError::Io(_)
                | EtlError::Csv(_)
                | EtlError::Arrow(_)
                | EtlError::Parquet(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_classification() {
        let io = EtlError::from(std::io::Error::other("disk gone"));
        assert!(io.is_storage());
        assert!(EtlError::Storage("put failed".into()).is_storage());
        assert!(!EtlError::Notify("topic missing".into()).is_storage());
        assert!(!EtlError::Parse { row: 3, reason: "bad".into() }.is_storage());
    }

    #[test]
    fn test_display_includes_row() {
        let err = EtlError::Parse { row: 7, reason: "unparseable_time".into() };
        assert_eq!(err.to_string(), "Parse error at row 7: unparseable_time");
    }
}
