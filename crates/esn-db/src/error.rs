//! Tagged store failures. Callers branch on the variant, never on message
//! text; `Unavailable` is always retriable.

use esn_schemas::CheckInStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The check-in was already resolved; carries the frozen status so the
    /// HTTP layer can answer idempotent re-confirmations.
    #[error("check-in already resolved as {status:?}")]
    AlreadyResolved { status: CheckInStatus },

    #[error("expired")]
    Expired,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A runtime invariant does not hold; the surrounding job must
    /// dead-letter, not retry.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row"),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Conflict(format!(
                    "unique constraint {}",
                    db.constraint().unwrap_or("<unnamed>")
                ))
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}
