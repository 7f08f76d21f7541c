//! Small text helpers shared across relay crates.

pub mod text;
