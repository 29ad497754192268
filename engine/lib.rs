#![feature(portable_simd)]
#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod arena;
pub mod config;
pub mod encode;
pub mod error;
pub mod io;
pub mod kernel;
pub mod missing;
pub mod partition;
pub mod pipeline;
pub mod prescan;
pub mod progress;
pub mod sample;
pub mod types;
pub mod write;

pub use config::DistanceConfig;
pub use error::{DosageError, Result};
pub use pipeline::{DistanceMatrix, Distances, compute_distances, run};
