#![warn(missing_docs)]

//! FleetFS transport subsystem: active/passive data connections, TLS, node transfer contract

pub mod connection;
pub mod error;
pub mod rpc;
pub mod service;
pub mod tls;
pub mod transfer;

pub use connection::{
    ActiveConnection, ConnectionConfig, DataConnection, DataStream, PassiveConnection, PortRange,
};
pub use error::{RemoteErrorKind, Result, TransportError};
pub use rpc::{DataChannel, TransferClient, TransferRequest, TransferResponse};
pub use service::NodeService;
pub use tls::{EncryptionContext, TlsConfig, TlsRole};
pub use transfer::{FileTransfer, SlaveTransfer, TransferMode, TransferStatus};
