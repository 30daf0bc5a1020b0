pub mod aggregate;
pub mod balancer;
pub mod error;
pub mod errorhandler;
pub mod event;
pub mod exchange;
pub mod idempotent;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod route;
pub mod saga;

pub use error::{ErrorKind, ProcessingError};
pub use exchange::{Exchange, ExchangePattern};
pub use processor::{Processor, SharedProcessor};
