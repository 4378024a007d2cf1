//! OCPI Core Library
//!
//! In-memory OCPI registry for the EMSP side of a CPO/EMSP roaming link.
//! Holds the resources a CPO publishes (locations, EVSEs, connectors,
//! tariffs, sessions, CDRs), the EMSP's own tokens, and the correlation
//! store for asynchronous command results.
//!
//! ## Conflict resolution
//!
//! Every resource carries `last_updated`. A full update (PUT) is accepted
//! only when it is strictly newer than the stored version, unless a
//! downgrade is explicitly allowed. Partial updates (PATCH) use JSON merge
//! patch semantics and never create resources. Each accepted mutation
//! recomputes the resource [`ETag`].
//!
//! ```text
//!  PUT  ──► VersionedStore::upsert ──► compare last_updated ──► commit / DowngradeRejected
//!  PATCH ─► VersionedStore::patch  ──► merge on a copy      ──► commit / NotFound
//! ```
//!
//! ## Command correlation
//!
//! Commands sent to a CPO are recorded in the [`CommandStore`]; the CPO's
//! later result callback is matched by command id.

pub mod types;
pub mod error;
pub mod resource;
pub mod patch;
pub mod store;
pub mod registry;
pub mod commands;
pub mod authorization;
pub mod clients;

pub use types::*;
pub use error::RegistryError;
pub use resource::{
    Cdr, Connector, Evse, Location, ObjectKey, Resource, ResourceKind, Session, Tariff, Token,
    TokenStatus, TokenType,
};
pub use store::{ListFilter, Page, Stored, Upserted, VersionedStore};
pub use registry::Registry;
pub use commands::{
    CommandError, CommandId, CommandRecord, CommandResult, CommandResultType, CommandStore,
    CommandType,
};
pub use authorization::{
    AllowedType, AuthorizationInfo, AuthorizationRequest, AuthorizationService, AuthorizeError,
    Authorizer, LocalAuthorizer, LocationReference, RealtimeAuthorization, RemoteAuthorizer,
};
pub use clients::ClientRegistry;
