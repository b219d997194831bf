//! Adaptive Cells
//!
//! An adaptive cell is a cached value derived from other cells and
//! collections. It recomputes only when it is forced while outdated.
//!
//! # How Forcing Works
//!
//! 1. A new cell starts outdated; nothing runs until the first force.
//!
//! 2. Forcing an up-to-date cell returns the cached result, whether that is
//!    a value or an error.
//!
//! 3. Forcing an outdated cell runs the derivation inside a tracking
//!    context. Every node read during the run becomes a producer; producers
//!    from the previous run that were not read again are disconnected.
//!
//! 4. A commit that writes a transitive producer marks the cell outdated.
//!    Producers declared with [`Runtime::connect`] are brought up to date
//!    before the derivation runs, even if it never reads them, so later
//!    writes behind them still reach the cell.
//!    The commit itself runs nothing, so many writes feeding one cell cost a
//!    single recomputation at the next force.
//!
//! # Failures
//!
//! A derivation that returns an error, or panics while
//! [`RuntimeConfig::catch_panics`](crate::RuntimeConfig) is set, has the error
//! cached as its result. Later forces report the same error until an input
//! changes. With `catch_panics` disabled the panic propagates and the cell
//! stays outdated.
//!
//! # Thread Safety
//!
//! The derivation runs under the cell's compute mutex, so concurrent forces
//! of one outdated cell run the derivation once; the other callers wait and
//! receive the cached result.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Readable, TrackingContext};
use crate::error::{Error, Result};
use crate::graph::{edges, AsNode, GraphNode, NodeCore, NodeId, NodeKind, NodeRef};
use crate::runtime::Runtime;

type Derive<T> = Box<dyn FnMut() -> Result<T> + Send>;

struct AdaptiveNode<T> {
    core: NodeCore,
    /// Held for the whole recomputation.
    derive: Mutex<Derive<T>>,
    cache: RwLock<Option<Result<T>>>,
    recomputations: AtomicU64,
}

impl<T> GraphNode for AdaptiveNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn bring_up_to_date(self: Arc<Self>) -> Result<()> {
        self.force().map(drop)
    }
}

impl<T> AdaptiveNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn force(self: &Arc<Self>) -> Result<T> {
        let id = self.core.id();
        if TrackingContext::is_computing(id) {
            let consumer = TrackingContext::current().unwrap_or(id);
            tracing::warn!(node = %id, "derivation depends on its own value");
            return Err(Error::Cycle {
                consumer,
                producer: id,
            });
        }

        let erased: Arc<dyn GraphNode> = self.clone();
        TrackingContext::track(&erased);

        let _shape = self.core.runtime().shape_read();
        let mut derive = self.derive.lock();

        if !self.core.is_outdated() {
            if let Some(cached) = self.cache.read().as_ref() {
                return cached.clone();
            }
        }

        edges::refresh_declared(&*erased);

        let derive: &mut Derive<T> = &mut derive;
        let ctx = TrackingContext::enter(id);
        let result = if self.core.runtime().config().catch_panics {
            panic::catch_unwind(AssertUnwindSafe(|| derive())).unwrap_or_else(|payload| {
                let err = Error::from_panic(payload);
                tracing::warn!(node = %id, error = %err, "derivation panicked");
                Err(err)
            })
        } else {
            derive()
        };
        let reads = ctx.take_reads();
        drop(ctx);

        let result = match edges::replace_tracked(&erased, reads) {
            Ok(()) => result,
            Err(err) => Err(err),
        };

        *self.cache.write() = Some(result.clone());
        self.core.take_outdated();
        let runs = self.recomputations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(node = %id, runs, ok = result.is_ok(), "adaptive recomputed");
        result
    }
}

/// A lazily recomputed value derived from other nodes.
pub struct Adaptive<T> {
    node: Arc<AdaptiveNode<T>>,
}

impl<T> Adaptive<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cell from an infallible derivation.
    pub fn new<F>(runtime: &Runtime, mut derive: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::try_new(runtime, move || Ok(derive()))
    }

    /// Create a cell from a derivation that may fail.
    pub fn try_new<F>(runtime: &Runtime, derive: F) -> Self
    where
        F: FnMut() -> Result<T> + Send + 'static,
    {
        Self {
            node: Arc::new(AdaptiveNode {
                core: NodeCore::new(runtime, NodeKind::Adaptive),
                derive: Mutex::new(Box::new(derive)),
                cache: RwLock::new(None),
                recomputations: AtomicU64::new(0),
            }),
        }
    }

    /// A cell holding `f` applied to `input`.
    pub fn map<R, F>(input: &R, f: F) -> Self
    where
        R: Readable,
        F: Fn(R::Value) -> T + Send + 'static,
    {
        let runtime = input.node().0.core().runtime().clone();
        let input = input.clone();
        Self::try_new(&runtime, move || Ok(f(input.read()?)))
    }

    /// Like [`map`](Self::map) for a fallible `f`.
    pub fn try_map<R, F>(input: &R, f: F) -> Self
    where
        R: Readable,
        F: Fn(R::Value) -> Result<T> + Send + 'static,
    {
        let runtime = input.node().0.core().runtime().clone();
        let input = input.clone();
        Self::try_new(&runtime, move || f(input.read()?))
    }

    /// A cell combining two inputs.
    pub fn map2<RA, RB, F>(a: &RA, b: &RB, f: F) -> Self
    where
        RA: Readable,
        RB: Readable,
        F: Fn(RA::Value, RB::Value) -> T + Send + 'static,
    {
        let runtime = a.node().0.core().runtime().clone();
        let (a, b) = (a.clone(), b.clone());
        Self::try_new(&runtime, move || Ok(f(a.read()?, b.read()?)))
    }

    /// The cell's node identifier.
    pub fn id(&self) -> NodeId {
        self.node.core.id()
    }

    /// Whether the next force will run the derivation.
    pub fn is_outdated(&self) -> bool {
        self.node.core.is_outdated()
    }

    /// How many times the derivation has run.
    pub fn recomputations(&self) -> u64 {
        self.node.recomputations.load(Ordering::Relaxed)
    }

    /// The up-to-date result, recomputing first if the cell is outdated.
    ///
    /// Inside another derivation the read is recorded as a dependency.
    pub fn force(&self) -> Result<T> {
        self.node.force()
    }

    fn erased(&self) -> Arc<dyn GraphNode> {
        self.node.clone()
    }
}

impl<T> Clone for Adaptive<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> AsNode for Adaptive<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node(&self) -> NodeRef {
        NodeRef(self.erased())
    }
}

impl<T> Readable for Adaptive<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn read(&self) -> Result<T> {
        self.force()
    }
}

impl<T> fmt::Debug for Adaptive<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adaptive")
            .field("id", &self.node.core.id())
            .field("outdated", &self.node.core.is_outdated())
            .field("cached", &*self.node.cache.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn nothing_runs_before_the_first_force() {
        let rt = Runtime::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let a = {
            let runs = runs.clone();
            Adaptive::new(&rt, move || {
                runs.fetch_add(1, Ordering::SeqCst);
                42
            })
        };

        assert!(a.is_outdated());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(a.force().unwrap(), 42);
        assert_eq!(a.force().unwrap(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(a.recomputations(), 1);
    }

    #[test]
    fn writes_outdate_dependents() {
        let rt = Runtime::new();
        let x = rt.changeable(2);
        let doubled = Adaptive::map(&x, |v| v * 2);

        assert_eq!(doubled.force().unwrap(), 4);
        rt.transact(|tx| x.write(tx, 5)).unwrap();
        assert!(doubled.is_outdated());
        assert_eq!(doubled.force().unwrap(), 10);
        assert_eq!(doubled.recomputations(), 2);
    }

    #[test]
    fn producers_follow_the_latest_run() {
        let rt = Runtime::new();
        let flag = rt.changeable(true);
        let left = rt.changeable(1);
        let right = rt.changeable(2);
        let pick = {
            let (flag, left, right) = (flag.clone(), left.clone(), right.clone());
            Adaptive::new(&rt, move || if flag.get() { left.get() } else { right.get() })
        };

        assert_eq!(pick.force().unwrap(), 1);
        assert!(pick.node().producers().contains(&left.id()));
        assert!(!pick.node().producers().contains(&right.id()));

        rt.transact(|tx| flag.write(tx, false)).unwrap();
        assert_eq!(pick.force().unwrap(), 2);
        assert!(!pick.node().producers().contains(&left.id()));

        // `left` is no longer read, so writing it leaves the cell up to date.
        rt.transact(|tx| left.write(tx, 10)).unwrap();
        assert!(!pick.is_outdated());
    }

    #[test]
    fn errors_are_cached_until_inputs_change() {
        let rt = Runtime::new();
        let x = rt.changeable(-1);
        let checked = Adaptive::try_map(&x, |v: i32| {
            if v < 0 {
                Err(Error::message("negative"))
            } else {
                Ok(v)
            }
        });

        assert!(checked.force().is_err());
        assert!(checked.force().is_err());
        assert_eq!(checked.recomputations(), 1);

        rt.transact(|tx| x.write(tx, 3)).unwrap();
        assert_eq!(checked.force().unwrap(), 3);
    }

    #[test]
    fn panics_become_cached_errors() {
        let rt = Runtime::new();
        let a: Adaptive<i32> = Adaptive::new(&rt, || panic!("boom"));

        let err = a.force().unwrap_err();
        assert!(matches!(err, Error::Panicked(ref m) if m == "boom"));
        assert!(!a.is_outdated());
    }

    #[test]
    fn panics_propagate_when_not_caught() {
        let rt = Runtime::with_config(RuntimeConfig::default().with_catch_panics(false));
        let a: Adaptive<i32> = Adaptive::new(&rt, || panic!("boom"));

        let caught = panic::catch_unwind(AssertUnwindSafe(|| a.force()));
        assert!(caught.is_err());
        assert!(a.is_outdated());
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let rt = Runtime::new();
        let slot: Arc<Mutex<Option<Adaptive<i32>>>> = Arc::new(Mutex::new(None));
        let a = {
            let slot = slot.clone();
            Adaptive::try_new(&rt, move || {
                let me = slot.lock().clone();
                match me {
                    Some(me) => me.force().map(|v| v + 1),
                    None => Ok(0),
                }
            })
        };
        *slot.lock() = Some(a.clone());

        assert!(matches!(a.force(), Err(Error::Cycle { .. })));
        // Break the reference cycle between the cell and its own closure.
        slot.lock().take();
    }

    #[test]
    fn map2_combines_inputs() {
        let rt = Runtime::new();
        let a = rt.changeable(3);
        let b = rt.changeable(4);
        let hyp = Adaptive::map2(&a, &b, |a: i32, b: i32| ((a * a + b * b) as f64).sqrt());
        assert_eq!(hyp.force().unwrap(), 5.0);

        let chained = Adaptive::map(&hyp, |h| h * 2.0);
        assert_eq!(chained.force().unwrap(), 10.0);
        assert!(chained.node().producers().contains(&hyp.id()));
    }

    #[test]
    fn committing_inside_a_derivation_is_rejected() {
        let rt = Runtime::new();
        let x = rt.changeable(0);
        let a = {
            let (inner_rt, x) = (rt.clone(), x.clone());
            Adaptive::try_new(&rt, move || inner_rt.transact(|tx| x.write(tx, 1)).map(|_| 0))
        };

        assert!(matches!(a.force(), Err(Error::CommitInsideDerivation)));
        assert_eq!(x.get(), 0);
    }

    #[test]
    fn declared_producers_are_current_after_a_force() {
        let rt = Runtime::new();
        let input = rt.changeable(1);
        let b = Adaptive::map(&input, |n| n + 1);
        let c = Adaptive::new(&rt, || 0);
        rt.connect(&c, &b).unwrap();

        assert_eq!(c.force().unwrap(), 0);
        assert!(!b.is_outdated());
        assert_eq!(b.recomputations(), 1);

        rt.transact(|tx| input.write(tx, 2)).unwrap();
        assert!(b.is_outdated());
        assert!(c.is_outdated());
    }
}
