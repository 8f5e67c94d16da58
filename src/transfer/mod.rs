//! Transfer coordination for `push` notifications.
//!
//! ```text
//! push -> CompletedCache? --yes--> ack
//!           | no
//!           v
//!      OngoingTransfers::add_if_absent --queued--> wait on driver
//!           | driver
//!           v
//!      request (owner) -> grant -> fetch -> cache + resolve -> publish `file`
//! ```

pub mod fetch;
pub mod protocol;
pub mod request;

pub use fetch::{Fetcher, LocalFetcher};
pub use protocol::{terminate_transfers, PushOutcome, TransferProtocol, TransferSettings};
pub use request::{RequestClient, RequestTimeouts, TcpRequestClient, TransferReply, TransferRequest};
