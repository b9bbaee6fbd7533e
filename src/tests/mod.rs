//! Crate-level kernel tests.

mod helpers;
mod property;
