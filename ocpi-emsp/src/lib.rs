//! # OCPI EMSP Receiver
//!
//! HTTP endpoints an EMSP exposes to its CPO counterparties (OCPI 2.2).
//!
//! ## Architecture
//!
//! ```text
//! CPO (counterparty)
//!       │ HTTPS, Authorization: Token ...
//!       ▼
//! ┌──────────────────────────────────────┐
//! │    ocpi-emsp                         │
//! │  observer chain (middleware)         │
//! │  access control → module handlers    │
//! │  Reply / Envelope                    │
//! └─────────────┬────────────────────────┘
//!               │
//!               ▼
//! ┌──────────────────────────────────────┐
//! │    ocpi-core                         │
//! │  Registry │ CommandStore │ Authorization
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Path | Methods |
//! |------|---------|
//! | `/locations/{cc}/{pid}/{id}[/{evse}[/{connector}]]` | GET, PUT, PATCH, DELETE (location) |
//! | `/tariffs/{cc}/{pid}/{id}` | GET, PUT, PATCH, DELETE |
//! | `/sessions/{cc}/{pid}/{id}` | GET, PUT, PATCH, DELETE |
//! | `/cdrs`, `/cdrs/{cc}/{pid}/{id}` | POST, GET |
//! | `/tokens`, `/tokens/{uid}/authorize` | GET, POST |
//! | `/commands/{type}/{id}` | POST |
//!
//! Outbound commands go through [`CommandDispatcher`], whose result
//! callbacks arrive on the commands module.

pub mod access;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod observer;
pub mod receiver;
pub mod server;

pub use access::{AccessControl, Caller};
pub use client::{ClientError, CommandDispatcher, CommandResponse, CommandResponseType, CpoClient, Dispatched};
pub use config::{CpoEndpoint, EmspConfig, PartyAccess};
pub use envelope::{Envelope, OcpiStatus, Reply};
pub use error::ReceiverError;
pub use observer::{ObserverChain, RequestInfo, RequestObserver, ResponseInfo, TracingObserver};
pub use receiver::{ReceiverState, SharedState};
pub use server::{router, serve_listener, serve_with_shutdown};
