#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod data;
pub mod diagnostics;
pub mod hurdle;
pub mod output;
pub mod pipeline;
pub mod profile;
