pub mod labour;

pub use labour::*;
