use std::{net::Ipv4Addr, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("no such network: {0}")]
    NoSuchNetwork(String),

    #[error("network already exists: {0}")]
    NetworkExists(String),

    #[error("no such network driver: {0}")]
    NoSuchDriver(String),

    #[error("invalid network name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid subnet {subnet:?}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("network interface {0} already exists")]
    DeviceExists(String),

    #[error("network interface {0} not found")]
    LinkNotFound(String),

    #[error("subnet {0} has no free address")]
    SubnetExhausted(String),

    #[error("address {address} is out of range for subnet {subnet}")]
    AddressOutOfRange { subnet: String, address: Ipv4Addr },

    #[error("malformed allocation table: {0}")]
    MalformedTable(String),

    #[error("namespace error: {message}")]
    Namespace {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("failed to lock {path:?}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },
}

impl NetError {
    pub fn invalid_name(name: &str, reason: &str) -> Self {
        NetError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_subnet(subnet: &str, reason: impl ToString) -> Self {
        NetError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn namespace(
        message: &str,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        NetError::Namespace {
            message: message.to_string(),
            source,
        }
    }
}
