pub mod backends;
pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod nn;
pub mod utils;

pub use backends::cpu::CpuTensor;
pub use backends::{Scalar, Tensor};
pub use config::TrainConfig;
pub use error::{NetError, Result};
pub use nn::sequential::{History, Sequential};
