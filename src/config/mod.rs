//! Target configurations.

mod target;

pub use target::{ConfigError, March, TargetConfig};

#[cfg(test)]
mod tests;
