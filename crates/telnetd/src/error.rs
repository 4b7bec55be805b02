//! Console error types

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("could not open ICMP socket: {0}")]
    IcmpSocket(io::Error),

    #[error("could not configure socket: {0}")]
    SocketOption(io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("account store error: {0}")]
    Accounts(String),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
