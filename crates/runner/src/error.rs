use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cleanup pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
