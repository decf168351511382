pub mod horizons;
pub mod types;

pub use horizons::*;
pub use types::*;
