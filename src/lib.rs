//! Deduplicated, failover-aware file transfer coordination over a
//! publish/subscribe bus.
//!
//! Providers announce files with `push` messages. Every chain listening to a
//! provider requests the file from its owner, fetches it, and announces the
//! local copy. Two process-wide registries make sure each uid is fetched at
//! most once at a time and at most once overall; a heartbeat monitor lets a
//! standby chain take over when the primary goes silent.

pub mod bus;
pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod message;
pub mod registry;
pub mod transfer;

pub use chain::{Chain, ChainController, ChainSet, ClientChains, ClientServices, ReloadReport};
pub use config::{ChainConfig, FerryConfig};
pub use error::{FerryError, Result};
pub use heartbeat::HeartbeatMonitor;
pub use listener::{Callback, Delivery, Listener, ListenerOptions};
pub use message::{Message, MessageType};
pub use registry::{CompletedCache, OngoingTransfers, Registries, TransferGuard};
pub use transfer::{PushOutcome, TransferProtocol, TransferSettings};
