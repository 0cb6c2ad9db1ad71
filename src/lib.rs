#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A blocking client engine for managing LPAR and z/VM images through their
//! hardware-management endpoints.
//!
//! The crate implements:
//! - a backend registry and session lifecycle shared by every server type,
//!   with the VM to VM5 login fallback and certificate confirmation
//! - the correlated command/response protocol of the event endpoint (LPAR)
//! - the ONC-RPC client of the RPC-based SMAPI server (VM)
//! - the framed request/response protocol of the socket-based SMAPI server,
//!   optionally over TLS with fingerprint pinning (VM5)
//! - a positional record decoder and a pseudo-XML tree parser
//!
//! Most callers only need [`Server`] and [`SessionManager`]; the protocol
//! modules are public for callers that bring their own transports.

mod crypto;
mod debug;
mod dialog;
mod error;
mod observe;
mod session;
mod types;

pub mod backend;
pub mod dsm;
pub mod event;
pub mod framed;
pub mod record;
pub mod rpc;
pub mod tcr;
pub mod transport;

pub use crate::backend::{Backend, Confirmation, ConsolePrompt, Prompt, Registry};
pub use crate::error::{
    ClassifiedError, Error, ErrorKind, Report, Result, ReturnCode, Severity,
};
pub use crate::session::{SessionManager, State};
pub use crate::tcr::CapacityRecord;
pub use crate::types::{
    DEFAULT_MSG_TIMEOUT, DEFAULT_SHUTDOWN_TIME, DEFAULT_TIMEOUT, Force, Image, ImageOp,
    ImageStatus, Parms, Server, ServerBuilder, ServerType,
};
