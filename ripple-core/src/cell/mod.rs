//! Scalar Cells
//!
//! Changeable cells are written by transactions; adaptive cells derive their
//! value from other nodes and refresh lazily. Both record reads through the
//! thread's tracking context.

mod adaptive;
mod changeable;
mod context;

pub use adaptive::Adaptive;
pub use changeable::{Changeable, Readable};
pub use context::untracked;
pub(crate) use context::TrackingContext;
