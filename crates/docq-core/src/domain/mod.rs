//! Domain model: item documents, identifiers, topics and lease identity.

pub mod ids;
pub mod item;
pub mod lease;
pub mod topic;

pub use ids::{ItemId, IdMarker};
pub use item::QueueItem;
pub use lease::{CodeVersion, LeaseOwner, host_identity};
pub use topic::Topic;
