pub mod context;
pub mod error;

pub use context::{ActorContext, ActorCtxExtractor, ActorType, ensure_actor};
pub use error::SecurityError;
