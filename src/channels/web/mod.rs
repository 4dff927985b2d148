//! HTTP gateway: routing, bearer auth, DTOs and error mapping.

pub mod auth;
pub mod errors;
pub mod server;
pub mod types;

pub use server::{GatewayState, router, start_server};
