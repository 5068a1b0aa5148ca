//!
//! # adjoint
//!
//! Facade over the reverse-mode autodiff engine and its companion
//! dense-matrix crate.
//!
//! The main entry point is [`Graph::var`], which records a leaf in the
//! computation graph; arithmetic on the returned [`Var`] handles builds
//! the graph, and [`Var::backward`] populates gradients on every
//! ancestor.
//!
//! ```
//! use adjoint::Graph;
//!
//! let graph = Graph::new();
//! let x = graph.var(2.0);
//! let y = graph.var(3.0);
//! let z = &x * &y + x.sin();
//!
//! z.backward();
//! assert_eq!(y.grad(), 2.0);
//!
//! x.zero_grad();
//! ```
//!

pub use lib_adjoint_core::*;

#[cfg(feature = "matrix")]
pub use lib_adjoint_matrix as matrix;
