//! # limiquantix Hypervisor
//!
//! Guest lifecycle management on top of a hypervisor backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             GuestManager                │
//! │  (create, run, shutdown, metrics, ...)  │
//! └─────────────────────┬───────────────────┘
//!                       │ acquire / release
//! ┌─────────────────────┴───────────────────┐
//! │            ConnectionPool               │
//! └─────────────────────┬───────────────────┘
//!                       │ Backend trait
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  LibvirtBackend   │     │    MockBackend    │
//! │   (via libvirt)   │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! Guests are rendered to libvirt domain/network XML by [`xml`], and live
//! statistics are normalized by [`metrics`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use limiquantix_hypervisor::{ConnectionPool, Guest, GuestManager, ManagerOptions, MockBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = ConnectionPool::new(Arc::new(MockBackend::new()), 4).unwrap();
//!     let manager = GuestManager::new(pool, ManagerOptions::default());
//!
//!     let guest = Guest::new("my-vm").with_cpu(2).with_memory(2048);
//!     let guest = manager.create(guest).await.unwrap();
//!     println!("{}", guest.state.unwrap_or_default());
//! }
//! ```

pub mod error;
pub mod traits;
pub mod types;
pub mod pool;
pub mod xml;
pub mod lifecycle;
pub mod metrics;
pub mod mock;
pub mod libvirt;

pub use error::{ErrorKind, HypervisorError, Result};
pub use traits::{Backend, Connection, DomainHandle, NetworkHandle};
pub use types::*;
pub use pool::{ConnectionPool, PooledConnection, DEFAULT_MAX_CONNECTIONS};
pub use lifecycle::{GuestManager, ManagerOptions, DEFAULT_GUEST_TYPE};
pub use xml::RenderOptions;
pub use mock::MockBackend;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
