use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} (kube error: {1})")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0} (database error: {1})")]
    DatabaseError(String, #[source] Box<mongodb::error::Error>),

    #[error("{0} (storage error: {1})")]
    StorageError(String, #[source] Box<opendal::Error>),

    #[error("invalid spec: {0}")]
    ValidationError(String),

    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(..) => "kube",
            Error::DatabaseError(..) => "database",
            Error::StorageError(..) => "storage",
            Error::ValidationError(..) => "validation",
            Error::InconsistentState(..) => "inconsistent_state",
            Error::SerializationError(..) => "serialization",
            Error::FormattingError(..) => "formatting",
        }
        .to_string()
    }

    /// Whether retrying without a user edit can ever succeed. Permanent
    /// errors park the stack in `Failed` instead of retrying auth
    /// rejections forever.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::KubeError(_, e) => matches!(
                e.as_ref(),
                kube::Error::Api(ae) if ae.code == 401 || ae.code == 403
            ),
            Error::DatabaseError(_, e) => {
                matches!(
                    *e.kind,
                    mongodb::error::ErrorKind::Authentication { .. }
                ) || matches!(
                    &*e.kind,
                    mongodb::error::ErrorKind::Command(c) if c.code == 13 || c.code == 18
                )
            }
            Error::ValidationError(..) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn test_validation_error_is_permanent() {
        assert!(Error::ValidationError("bad stackID".into()).is_permanent());
    }

    #[test]
    fn test_inconsistent_state_is_transient() {
        assert!(!Error::InconsistentState("secret vanished".into()).is_permanent());
    }
}
