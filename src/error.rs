use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Unable to read '{}': {source}", path.display())]
    MissingInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid GeoJSON in '{}': {reason}", path.display())]
    InvalidGeoJson { path: PathBuf, reason: String },

    #[error("Column '{column}' not found in '{}'", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("Malformed row {row} in '{}': {reason}", path.display())]
    MalformedRow {
        path: PathBuf,
        row: usize,
        reason: String,
    },

    #[error("Nucleus {id} is malformed: {reason}")]
    MalformedFeature { id: u32, reason: String },

    #[error("Nucleus {id} has a degenerate polygon (zero signed area)")]
    DegeneratePolygon { id: u32 },

    #[error("Nucleus id {0} appears more than once in the catalog")]
    DuplicateNucleusId(u32),

    #[error("Can't extract channel number from override column '{0}'")]
    MalformedOverrideColumn(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Acquiring inputs for '{}' timed out", image.display())]
    TimedOut { image: PathBuf },

    #[error("Batch was cancelled")]
    Cancelled,

    #[error("JSON array stream is already closed")]
    StreamClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl JoinError {
    // Failures that belong to one image's inputs rather than to the run itself.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(
            self,
            JoinError::MissingInput { .. }
                | JoinError::InvalidGeoJson { .. }
                | JoinError::MissingColumn { .. }
                | JoinError::MalformedRow { .. }
                | JoinError::DuplicateNucleusId(_)
                | JoinError::TimedOut { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, JoinError>;
