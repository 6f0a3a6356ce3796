pub mod client;
pub mod error;
pub mod model;

pub use client::AdminClient;
pub use error::{Error, Result, StatusClass};
