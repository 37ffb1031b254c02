use std::{io, net::SocketAddr};

use common::{CodecError, Dpid};
use thiserror::Error;

/// A request or configuration could not be handed to a switch.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("switch {0} has no known datapath connection")]
    UnknownDatapath(Dpid),
    #[error("failed to encode frame for {dpid}: {source}")]
    Encode { dpid: Dpid, source: CodecError },
    #[error("failed to send to {dpid} at {addr}: {source}")]
    Io {
        dpid: Dpid,
        addr: SocketAddr,
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead { path: String, source: io::Error },
    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: String,
        source: serde_json::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
