use thiserror::Error;

/// Errors raised by delivery log and subscription stores.
///
/// These are infrastructure failures: delivery outcomes (remote rejections,
/// timeouts) are never reported through this type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Delivery already exists: {0}")]
    DuplicateDelivery(String),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Blocking store task failed: {0}")]
    Task(String),
}
