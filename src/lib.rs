pub mod broker;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod exchange;
pub mod factory;
pub mod flow;
pub mod observer;
pub mod packet;
pub mod pattern;
pub mod registry;
pub mod states;
pub mod tx;

pub use error::{Error, Result};
