//! # Replication Manager
//!
//! The coordination core of a replicated database environment: it keeps a
//! mesh of TCP connections between sites, elects a single master, and
//! tracks acknowledgements of replicated log records against a
//! configurable durability policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           ReplicationManager                              │
//! │                                                                           │
//! │  ┌──────────────┐   frames   ┌───────────────┐   pop   ┌──────────────┐   │
//! │  │   Selector   │───────────►│ Message Queue │────────►│  Messengers  │   │
//! │  │ (listener +  │            │  (bounded)    │         │ (nthreads)   │   │
//! │  │  all reads)  │            └───────────────┘         └──────┬───────┘   │
//! │  └──────┬───────┘                                             │           │
//! │         │ attach / lost                        ┌──────────────┼────────┐  │
//! │         ▼                                      ▼              ▼        ▼  │
//! │  ┌──────────────┐                       ┌───────────┐  ┌──────────┐ ┌───┐ │
//! │  │  Connection  │◄──────── send ────────│ Election  │  │   Ack    │ │App│ │
//! │  │   Manager    │                       │ Manager   │  │ Tracker  │ │ly │ │
//! │  └──────────────┘                       └───────────┘  └──────────┘ └───┘ │
//! │                                                                           │
//! │  Shared: one Mutex<RepState> (sites, role, election, acks) + `finished`   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use repmgr::{AckPolicy, RepMgrConfig, ReplicationManager, StartMode};
//!
//! #[tokio::main]
//! async fn main() -> repmgr::Result<()> {
//!     let mgr = ReplicationManager::new(RepMgrConfig::default());
//!     mgr.set_local_site("db1.example.com", 5001).await?;
//!     mgr.add_remote_site("db2.example.com", 5001, true).await?;
//!     mgr.set_ack_policy(AckPolicy::Quorum).await?;
//!
//!     mgr.start(3, StartMode::Election).await?;
//!     // ...
//!     mgr.close().await
//! }
//! ```

pub mod ack;
pub mod apply;
pub mod config;
pub mod connection;
pub mod election;
pub mod error;
pub mod manager;
mod messenger;
pub mod metrics;
pub mod queue;
pub mod resilience;
mod selector;
pub mod site;
pub mod wire;

// Re-exports for convenience
pub use ack::{AckDegrade, AckPolicy};
pub use apply::{NoOpApply, ReplicationApply, Transport};
pub use config::{ConnectionConfig, ElectionConfig, HeartbeatConfig, RepMgrConfig};
pub use error::{RepMgrError, Result};
pub use manager::{ManagerState, RepRole, RepStatus, ReplicationManager, SiteStatus, StartMode};
pub use site::{AddSite, Eid, SiteAddr, SELF_EID};
pub use wire::Message;
