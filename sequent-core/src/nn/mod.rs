pub mod activations;
pub mod initializers;
pub mod layers;
pub mod losses;
pub mod optimizers;
pub mod sequential;
