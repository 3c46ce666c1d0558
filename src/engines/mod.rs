pub mod grid;

pub use grid::GridEngine;
