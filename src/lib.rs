//! vla-synth: episode synthesis for vision-language-action robot datasets.
//!
//! A run samples a natural-language manipulation task per seed, builds a
//! randomized scene for it, drives a scripted controller through the
//! simulator and archives the resulting observation/action trajectory.

pub mod archive;
pub mod array;
pub mod config;
pub mod error;
pub mod geometry;
pub mod orchestrator;
pub mod planner;
pub mod scene;
pub mod seed;
pub mod task;
pub mod trajectory;

#[cfg(test)]
mod test_support;
