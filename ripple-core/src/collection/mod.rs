//! Delta Collections
//!
//! Sets, lists and maps that propagate changes as deltas rather than as
//! whole values.
//!
//! A changeable collection is written through a transaction. A derived
//! collection is built by a combinator such as [`Collection::map`] and keeps
//! its content up to date by processing only the deltas of its inputs since
//! its last refresh. Every collection keeps a delta log shared by its
//! [`Reader`]s; a reader's first pull returns the content as additions and
//! later pulls return what changed in between.
//!
//! ```
//! use ripple_core::{Runtime, SetDelta};
//!
//! let rt = Runtime::new();
//! let numbers = rt.changeable_set([1, 2, 3]);
//! let evens = numbers.filter(|n| n % 2 == 0);
//!
//! let reader = evens.subscribe();
//! assert_eq!(reader.pull().unwrap(), vec![SetDelta::Add(2)]);
//!
//! rt.transact(|tx| {
//!     numbers.insert(tx, 4)?;
//!     numbers.remove(tx, 2)
//! })
//! .unwrap();
//! assert_eq!(
//!     reader.pull().unwrap(),
//!     vec![SetDelta::Add(4), SetDelta::Remove(2)]
//! );
//! ```

mod delta;
mod fold;
mod history;
mod list;
mod map;
mod node;
mod position;
mod reader;
mod set;

pub use delta::{apply_all, Delta, Element, ListDelta, MapDelta, SetDelta, Value};
pub use list::ChangeableList;
pub use map::ChangeableMap;
pub use node::{Collection, ListCollection, MapCollection, SetCollection};
pub use reader::Reader;
pub use set::ChangeableSet;
