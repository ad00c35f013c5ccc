//! Proxmox VE REST API Client
//!
//! A Rust client library for the Proxmox VE management API (`/api2/json`).
//! Provides type-safe models and methods for the inventory, storage,
//! container lifecycle, access control and firewall endpoints the
//! provisioner relies on.
//!
//! # Example
//!
//! ```no_run
//! use pve_client::{PveClient, PveClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PveClient::new(
//!     "https://localhost:8006".to_string(),
//!     "root@pam!provisioner=00000000-0000-0000-0000-000000000000".to_string(),
//! )?;
//!
//! // Every container and VM id in the cluster
//! let guests = client.cluster_resources(Some("vm")).await?;
//!
//! // Storages on one node that can hold container root filesystems
//! let pools: Vec<_> = client
//!     .list_storage("pve1")
//!     .await?
//!     .into_iter()
//!     .filter(|s| s.active && s.supports("rootdir"))
//!     .collect();
//! # let _ = (guests, pools);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod common;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod pve_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::PveClient;
pub use common::HttpClient;
pub use error::PveError;
pub use models::*;
pub use pve_trait::PveClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockPveClient;
