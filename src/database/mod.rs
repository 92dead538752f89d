//! Database handles and store proxies over the engine.
//!
//! A [`Database`] is opened (and, when its version moves forward, upgraded)
//! against an [`Engine`](crate::engine::Engine). Once open it hands out a
//! [`Store`] per object store. Store operations take [`Handlers`] and
//! complete on a later turn of the engine's event loop.

mod collector;
mod dispatch;
mod handle;
mod request;
mod store;

pub use dispatch::{BoundRequest, Operation, OperationRequest, Outcome};
pub use handle::{Database, Lifecycle, Upgrade};
pub use request::Handlers;
pub use store::Store;
