//! Request/grant exchange with the file owner.
//!
//! The requester names the uid and where it wants the file; the owner
//! answers with a grant carrying the file location, or a refusal.

use crate::bus::wire::{read_json, write_json, FrameType};
use crate::error::{FerryError, Result};
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub uid: String,
    pub topic: String,
    /// Directory the requester will place the file in
    pub destination: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl TransferRequest {
    pub fn new(uid: &str, message: &Message, destination: &Path) -> Self {
        Self {
            uid: uid.to_string(),
            topic: message.topic.clone(),
            destination: destination.to_string_lossy().into_owned(),
            data: message.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TransferReply {
    Granted {
        /// Where the granted file can be fetched from
        uri: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Refused {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// Bound on connecting and delivering the request
    pub request: Duration,
    /// Bound on waiting for the owner's reply
    pub transfer: Duration,
}

#[async_trait]
pub trait RequestClient: Send + Sync {
    async fn request(
        &self,
        address: &str,
        request: &TransferRequest,
        timeouts: RequestTimeouts,
    ) -> Result<TransferReply>;
}

/// Sends one `Request` frame per connection and reads one `Reply` frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpRequestClient;

fn timed_out(address: &str, timeout: Duration) -> FerryError {
    FerryError::RequestTimeout {
        address: address.to_string(),
        timeout,
    }
}

#[async_trait]
impl RequestClient for TcpRequestClient {
    async fn request(
        &self,
        address: &str,
        request: &TransferRequest,
        timeouts: RequestTimeouts,
    ) -> Result<TransferReply> {
        let send = async {
            let mut stream = TcpStream::connect(address).await?;
            write_json(&mut stream, FrameType::Request, request).await?;
            Ok::<_, FerryError>(stream)
        };
        let mut stream = tokio::time::timeout(timeouts.request, send)
            .await
            .map_err(|_| timed_out(address, timeouts.request))??;
        debug!(uid = %request.uid, %address, "Request sent, awaiting reply");

        tokio::time::timeout(
            timeouts.transfer,
            read_json::<_, TransferReply>(&mut stream, FrameType::Reply),
        )
        .await
        .map_err(|_| timed_out(address, timeouts.transfer))?
    }
}
