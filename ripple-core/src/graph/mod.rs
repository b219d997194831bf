//! Dependency Graph
//!
//! This module implements the graph that records which nodes read which.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are changeable cells, adaptive cells and collections
//! - Edges represent reads: if A reads B, B is a producer of A and A is a
//!   consumer of B
//!
//! When a transaction commits, we walk from each written node to its
//! transitive consumers and mark them outdated. Nothing is recomputed at that
//! point; outdated nodes refresh when they are next pulled.
//!
//! # Design Decisions
//!
//! 1. Edges live on the nodes themselves rather than in a central table, so a
//!    node that nobody holds can be freed without touching a registry.
//!
//! 2. Consumers hold owning `Arc`s to their producers; producers hold `Weak`
//!    back-references to their consumers. A derived node that is no longer
//!    referenced is dropped and unlinks itself.
//!
//! 3. Cycles are rejected when an edge is created, so the mark phase can
//!    assume a DAG.

pub(crate) mod edges;
pub(crate) mod mark;
mod node;

pub use node::{AsNode, NodeId, NodeKind, NodeRef};
pub(crate) use node::{GraphNode, NodeCore};
