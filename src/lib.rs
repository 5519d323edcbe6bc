//! Delta-Gamma hurdle models for zero-inflated positive survey data.
//!
//! `gam` is the penalized-likelihood engine; `delta` builds presence, magnitude and
//! combined predictions on top of it.

#![deny(dead_code)]
#![deny(unused_variables)]

#[path = "../gam/mod.rs"]
pub mod gam;

#[path = "../delta/mod.rs"]
pub mod delta;
