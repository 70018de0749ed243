//! Persistence for webhook subscriptions and the delivery log.
pub mod error;
pub mod memory;
pub mod record;
pub mod sqlite;
pub mod subscription;
pub mod traits;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use record::{DEFAULT_MAX_ATTEMPTS, DeliveryAttemptRecord, DeliveryId, DeliveryStatus};
pub use sqlite::SqliteStore;
pub use subscription::{SECRET_PREFIX, Subscription, generate_secret};
pub use traits::{DeliveryLogStore, SubscriptionStore};
