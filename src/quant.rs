//! Quantitative building blocks.

pub mod portfolio;
