#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod construction;
pub mod estimate;
pub mod faer_ndarray;
pub mod family;
pub mod model;
pub mod pirls;
pub mod seeding;
