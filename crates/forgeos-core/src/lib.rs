pub mod canonical;
pub mod errors;
pub mod model;
pub mod validate;

pub use canonical::*;
pub use errors::*;
pub use model::*;
pub use validate::*;
