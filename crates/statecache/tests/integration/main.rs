// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod blocking;
pub mod dapr;
pub mod e2e;
pub mod utils;

pub use utils::*;
