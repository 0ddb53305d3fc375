//! Configuration sections, one per relay concern

pub mod backends;
pub mod dispatcher;

pub use backends::*;
pub use dispatcher::*;
