//! Tokio actors that own the bus connection
//!
//! Each actor owns its state and is driven by the channels it was built with;
//! it stops once those channels close.

use std::future::Future;

use tokio::task::JoinHandle;

pub mod client;
pub mod dispatch;

pub use client::{AutoStart, ClientHandle, spawn_client};
pub use dispatch::DispatchHandle;

/// A [Tokio actor](https://ryhl.io/blog/actors-with-tokio/)
pub trait Actor: Sized + Send + 'static {
    /// Drive the actor until its channels close.
    fn run(self) -> impl Future<Output = ()> + Send;

    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
