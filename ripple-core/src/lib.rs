//! Ripple Core
//!
//! This crate provides the runtime for Ripple, an incremental functional
//! computation engine. It implements:
//!
//! - Changeable cells written through atomic transactions
//! - Adaptive cells that cache a derived value and recompute lazily
//! - Delta collections (sets, lists, maps) whose combinators process only
//!   what changed
//! - Readers that pull a collection's deltas since their previous pull
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Node identities and the dependency edges between nodes
//! - `cell`: Changeable and adaptive scalar cells
//! - `transaction`: Staging and atomic commit of writes
//! - `collection`: Delta types, collection nodes, combinators and readers
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{Adaptive, Runtime};
//!
//! let rt = Runtime::new();
//! let distance = rt.changeable(100.0_f64);
//! let speed = rt.changeable(4.0_f64);
//! let minutes = Adaptive::map2(&distance, &speed, |d, s| d / s);
//!
//! // Nothing runs until the value is needed.
//! assert_eq!(minutes.recomputations(), 0);
//! assert_eq!(minutes.force().unwrap(), 25.0);
//!
//! // Both writes land together, so the cell recomputes once.
//! rt.transact(|tx| {
//!     distance.write(tx, 60.0)?;
//!     speed.write(tx, 6.0)
//! })
//! .unwrap();
//! assert_eq!(minutes.force().unwrap(), 10.0);
//! assert_eq!(minutes.recomputations(), 2);
//! ```

pub mod cell;
pub mod collection;
pub mod config;
pub mod error;
pub mod graph;
pub mod runtime;
pub mod transaction;

pub use cell::{untracked, Adaptive, Changeable, Readable};
pub use collection::{
    apply_all, ChangeableList, ChangeableMap, ChangeableSet, Collection, Delta, Element,
    ListCollection, ListDelta, MapCollection, MapDelta, Reader, SetCollection, SetDelta, Value,
};
pub use config::RuntimeConfig;
pub use error::{Error, Result, TxStatus};
pub use graph::{AsNode, NodeId, NodeKind, NodeRef};
pub use runtime::Runtime;
pub use transaction::Transaction;
