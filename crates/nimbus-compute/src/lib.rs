pub mod addresses;
mod audit;
pub mod catalog;
pub mod lifecycle;
pub mod models;
mod resize;
mod service;
pub mod tracker;

#[cfg(test)]
mod test_support;

use uuid::Uuid;

pub use audit::AuditReport;
pub use lifecycle::Operation;
pub use models::ServerState;
pub use service::{ComputeService, CreateServer, LifecycleConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server not found: {0}")]
    ServerNotFound(Uuid),

    #[error("flavor not found: {0}")]
    FlavorNotFound(Uuid),

    #[error("image not found: {0}")]
    ImageNotFound(Uuid),

    #[error("cannot {operation} a server in state {state}")]
    InvalidStateTransition {
        state: ServerState,
        operation: Operation,
    },

    #[error("server {0} has an operation in progress")]
    ServerBusy(Uuid),

    #[error("image {image} is incompatible with flavor {flavor}: {reason}")]
    IncompatibleImage {
        image: Uuid,
        flavor: Uuid,
        reason: String,
    },

    #[error("invalid resize: {0}")]
    InvalidResize(String),

    #[error("flavor name already in use: {0}")]
    DuplicateFlavor(String),

    #[error("image {0} is operator-provided and read-only")]
    ImageReadOnly(Uuid),

    #[error("insufficient host capacity: {0}")]
    InsufficientCapacity(String),

    #[error("address pool exhausted")]
    AddressPoolExhausted,

    #[error(transparent)]
    Driver(#[from] nimbus_infra::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
