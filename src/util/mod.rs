//! Utility functions and helpers.

mod logging;
mod shutdown;

pub use logging::init_logging;
pub use shutdown::{ServiceHandle, ShutdownSignal};
