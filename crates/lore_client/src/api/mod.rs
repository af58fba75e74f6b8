pub mod client;
pub mod middleware;
