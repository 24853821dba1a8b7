//! The attendance daemon: tarpc server, subscriber push channel and the
//! client-side helpers that talk to it.

pub mod rpc_client;
pub mod rpc_server;
pub mod rpc_subscription;
pub mod subscribers;

#[cfg(test)]
mod rpc_tests;
