pub mod client;
pub mod server;
pub mod shared;

pub use client::StreamClient;
pub use server::{RuntimeConfig, Server};
