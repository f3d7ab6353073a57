//! Data models shared by the pool, the drivers and the facade.

pub mod value;

pub use value::{Column, Params, Value};
