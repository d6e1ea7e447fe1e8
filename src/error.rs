use thiserror::Error;

/// Errors surfaced by the builders.
///
/// Construction is all-or-nothing: any error aborts the current phase and the
/// caller retries with an adjusted configuration (or, for [`Error::SeedRejected`]
/// with an unset seed, the builder retries automatically with a fresh seed).
#[derive(Error, Debug)]
pub enum Error {
    #[error("seed {seed} did not work: duplicate hashes in bucket {bucket}")]
    SeedRejected { seed: u64, bucket: u64 },

    #[error(
        "using 64-bit hash codes with more than 2^30 keys is dangerous due to collisions: \
         use 128-bit hash codes instead"
    )]
    HashCollisionRisk,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("not enough resources in phase '{phase}': {detail}")]
    ResourceExhausted { phase: &'static str, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::ConfigInvalid(msg.into())
    }

    pub fn is_seed_rejection(&self) -> bool {
        matches!(self, Error::SeedRejected { .. })
    }
}
