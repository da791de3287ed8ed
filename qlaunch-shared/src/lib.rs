//! Types shared between the qlaunch library and its front-ends.

pub mod errors;

pub use errors::{QlaunchError, QlaunchResult};
