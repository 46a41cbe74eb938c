//! C4/C5 — layered `control/`-style configuration store and the
//! vpopmail-compatible virtual-user resolver, spec.md §4.4/§4.5.
//!
//! Grounded on `smtp-queue-fs`'s use of `openat::Dir` for close-on-exec,
//! O_RDONLY directory handles (spec.md §5 "file-descriptor discipline"),
//! and on `original_source/qsmtpd/backends/user_vpopm/vpop.c` for the
//! `users/cdb` lookup algorithm and the `.qmail-*` probe order. Uses `cdb`
//! for the CDB format and `openat` for close-on-exec directory handles, the
//! same crates the teacher's Cargo.toml already pins for this concern.

mod store;
mod vpop;

pub use store::{find_domain_in, load_scope_file, ConfigError, ConfigStore, Scope, UserConf};
pub use vpop::{user_exists, UserExistence, VpopError};
