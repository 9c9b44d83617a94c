use thiserror::Error;

/// Errors surfaced by the coordination-store handler.
///
/// `Unavailable` covers the transient window around a session loss; callers
/// are expected to retry on the next tick or watch fire.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no such key: {0}")]
    NoNode(String),

    #[error("key already exists: {0}")]
    NodeExists(String),

    #[error("version conflict on {0}")]
    BadVersion(String),

    #[error("lock failed on {0}: {1}")]
    Lock(String, String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<zookeeper::ZkError> for StoreError {
    fn from(err: zookeeper::ZkError) -> Self {
        use zookeeper::ZkError;
        match err {
            ZkError::NoNode => StoreError::NoNode(String::new()),
            ZkError::NodeExists => StoreError::NodeExists(String::new()),
            ZkError::BadVersion => StoreError::BadVersion(String::new()),
            ZkError::ConnectionLoss | ZkError::OperationTimeout | ZkError::SessionExpired => {
                StoreError::Unavailable(format!("{err:?}"))
            }
            other => StoreError::Backend(format!("{other:?}")),
        }
    }
}
