// Crate-wide error type. Load-time I/O problems are the only errors that
// propagate out of the schedule layer; per-row and per-trip anomalies are
// absorbed where they occur.

#[derive(Debug)]
pub enum RailError {
    FileError(String),
    ParseError(String),
    NetworkError(String),
    RateLimited(String),
}

impl std::fmt::Display for RailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RailError::FileError(e) => write!(f, "File error: {}", e),
            RailError::ParseError(e) => write!(f, "Parse error: {}", e),
            RailError::NetworkError(e) => write!(f, "Network error: {}", e),
            RailError::RateLimited(e) => write!(f, "Rate limited: {}", e),
        }
    }
}

impl std::error::Error for RailError {}

pub type Result<T> = std::result::Result<T, RailError>;
