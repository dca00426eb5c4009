pub mod migrations_config;
pub mod sources;
pub mod validation;

pub use migrations_config::*;
pub use sources::*;
pub use validation::*;
