//! ---
//! upw_section: "05-networking-external-interfaces"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Remote device record access."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Remote state client for the `updatable_services` field of the device
//! record. Writes are partial: only the keys named by a diff are touched.

pub mod error;
pub mod firestore;
pub mod store;
pub mod token;

pub use error::{RemoteError, Result};
pub use firestore::{quote_field_path, FirestoreRemote};
pub use store::{MemoryRemote, RemoteStateStore};
pub use token::{IdToken, TokenProvider};
