//! Fallback Graph
//!
//! Static map from a failing route to one alternate route. When a route
//! exhausts its retries the dispatcher asks the graph for the next hop.
//!
//! # Architecture
//!
//! ```text
//! Route 1 (reasoning) exhausted
//!         |
//!         v
//! FallbackGraph.next(1) -> Some(2)
//!         |
//!         v
//! CallContext.fallback_attempted? --yes--> AllRoutesFailed (terminal)
//!         | no
//!         v
//! Route 2 (fast), same payload and options
//! ```
//!
//! Cycle prevention does not walk the graph. Edges may form loops
//! (reasoning <-> fast); the per-call `fallback_attempted` flag caps every call
//! at one hop.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::options::DispatchOptions;

// ============================================================================
// Fallback Graph
// ============================================================================

/// Errors building a fallback graph
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FallbackGraphError {
    /// An edge pointing back at its own route
    #[error("route {0} cannot fall back to itself")]
    SelfLoop(u32),

    /// A second outgoing edge for the same route
    #[error("route {route} already falls back to {existing}")]
    DuplicateEdge {
        /// Source route
        route: u32,
        /// Target already registered
        existing: u32,
    },
}

/// At most one outgoing edge per route
#[derive(Clone, Debug, Default)]
pub struct FallbackGraph {
    edges: HashMap<u32, u32>,
}

impl FallbackGraph {
    /// Empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge `from -> to`
    pub fn add_edge(&mut self, from: u32, to: u32) -> Result<(), FallbackGraphError> {
        if from == to {
            return Err(FallbackGraphError::SelfLoop(from));
        }
        if let Some(&existing) = self.edges.get(&from) {
            return Err(FallbackGraphError::DuplicateEdge {
                route: from,
                existing,
            });
        }
        self.edges.insert(from, to);
        Ok(())
    }

    /// Builder form of [`add_edge`](Self::add_edge)
    pub fn with_edge(mut self, from: u32, to: u32) -> Result<Self, FallbackGraphError> {
        self.add_edge(from, to)?;
        Ok(self)
    }

    /// The alternate route for `route_id`
    #[must_use]
    pub fn next(&self, route_id: u32) -> Option<u32> {
        self.edges.get(&route_id).copied()
    }

    /// All edges ordered by source route
    #[must_use]
    pub fn edges(&self) -> Vec<(u32, u32)> {
        let mut edges: Vec<_> = self.edges.iter().map(|(&a, &b)| (a, b)).collect();
        edges.sort_unstable();
        edges
    }

    /// Number of edges
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no edges
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

// ============================================================================
// Call Context
// ============================================================================

/// Per-invocation dispatch state
///
/// Created for each `dispatch` call and discarded afterwards.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Correlation id for logs
    pub call_id: Uuid,
    /// Route originally requested by the caller
    pub original_route: u32,
    /// Route currently being served
    pub route_id: u32,
    /// Caller payload
    pub payload: String,
    /// Per-call options
    pub options: DispatchOptions,
    /// Set once the single fallback hop has been taken
    pub fallback_attempted: bool,
}

impl CallContext {
    /// Create a context for a fresh call
    pub fn new(route_id: u32, payload: impl Into<String>, options: DispatchOptions) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            original_route: route_id,
            route_id,
            payload: payload.into(),
            options,
            fallback_attempted: false,
        }
    }

    /// Caller label
    #[must_use]
    pub fn source(&self) -> &str {
        &self.options.source
    }

    /// Redirect this call to its fallback route
    ///
    /// Returns `false` (and changes nothing) if the hop was already taken.
    pub fn take_fallback(&mut self, target: u32) -> bool {
        if self.fallback_attempted {
            return false;
        }
        self.fallback_attempted = true;
        self.route_id = target;
        true
    }

    /// Whether the current route is a fallback
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.route_id != self.original_route
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_edges() {
        let graph = FallbackGraph::new()
            .with_edge(1, 2)
            .unwrap()
            .with_edge(2, 1)
            .unwrap()
            .with_edge(3, 1)
            .unwrap();

        assert_eq!(graph.next(1), Some(2));
        assert_eq!(graph.next(3), Some(1));
        assert_eq!(graph.next(9), None);
        assert_eq!(graph.edges(), vec![(1, 2), (2, 1), (3, 1)]);
    }

    #[test]
    fn test_graph_rejects_invalid_edges() {
        let mut graph = FallbackGraph::new();
        assert_eq!(graph.add_edge(4, 4), Err(FallbackGraphError::SelfLoop(4)));
        graph.add_edge(4, 5).unwrap();
        assert_eq!(
            graph.add_edge(4, 6),
            Err(FallbackGraphError::DuplicateEdge {
                route: 4,
                existing: 5
            })
        );
    }

    #[test]
    fn test_single_hop() {
        let mut ctx = CallContext::new(1, "x", DispatchOptions::default());
        assert!(!ctx.is_fallback());
        assert!(ctx.take_fallback(2));
        assert!(ctx.is_fallback());
        assert_eq!(ctx.route_id, 2);

        assert!(!ctx.take_fallback(1));
        assert_eq!(ctx.route_id, 2);
        assert_eq!(ctx.original_route, 1);
    }
}
