//! Remote network-driver protocol endpoint.

pub mod server;
