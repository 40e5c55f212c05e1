#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod config;
pub mod pipeline;
pub mod types;

pub use config::{BuildError, Builder};
pub use pipeline::WorkQueue;
pub use types::Lifecycle;

/// The crate version, as recorded in the package manifest.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// The crate authors, as recorded in the package manifest.
pub fn author() -> &'static str {
    env!("CARGO_PKG_AUTHORS")
}

/// The crate license identifier, as recorded in the package manifest.
pub fn license() -> &'static str {
    env!("CARGO_PKG_LICENSE")
}
