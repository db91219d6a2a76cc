// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Persistent registry of model names known to tokmeter.
//!
//! Models live in two categories. `official` names are kept in alphabetical
//! order; `custom` names are ranked by how often they have been used. The
//! registry is stored as a single JSON document (see [`store::JsonStore`]),
//! cached in memory and revalidated against the file's modification time, so
//! edits made by another process are picked up on the next read.
//!
//! All mutations go through [`RegistryService::add_model`], which serialises
//! the whole read-modify-write cycle behind one lock, bumps a process-local
//! version counter and then notifies subscribers in completion order.

mod backend;
mod entry;
mod error;
mod migrate;
mod notify;
mod service;

pub use backend::RegistryBackend;
pub use entry::{normalize_name, ModelEntry, Registry, DEFAULT_CUSTOM_LIMIT, MIN_NAME_LEN};
pub use error::RegistryError;
pub use migrate::migrate;
pub use notify::{Notifier, SubscriberId};
pub use service::{AddOutcome, RegistryOptions, RegistryService};
