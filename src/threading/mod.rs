//! Worker thread ownership and work queues.
//!
//! Every manager owns a [`ThreadedHandler`] running a small fixed set of
//! named OS threads. Consumers block on a [`WorkQueue`] or [`Signal`] and are
//! woken explicitly on shutdown.

pub mod handler;
pub mod queue;

pub use handler::{StopFlag, ThreadWorker, ThreadedHandler};
pub use queue::{Signal, WorkQueue};
