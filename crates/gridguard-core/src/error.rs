//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Consumer scheduling and load-balancing control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use gridguard_persistence::PersistenceError;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building or driving the scheduler.
///
/// Device command failures are not represented here: they are logged where
/// they happen and the next guard cycle retries naturally.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid configuration for `{subject}`: {reason}")]
    InvalidConfiguration { subject: String, reason: String },
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),
    #[error("consumer `{0}` does not balance its load dynamically")]
    NotDynamic(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("guard service is not running")]
    ServiceStopped,
    #[error("guard task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CoreError {
    pub(crate) fn invalid(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidConfiguration {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}
