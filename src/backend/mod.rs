//! Backend data model and selection.

pub mod algorithms;
mod context;
mod record;
mod selector;

pub use context::RequestContext;
pub use record::{Backend, ServerMetrics, TlsSettings};
pub use selector::{SelectError, SelectorEngine};
