//! C13 — TLS adapter: Qsmtpd's certificate selection ladder and optional
//! client-certificate relay grant (§4.7/§4.13), and Qremote's DANE/PKIX
//! server verification policy (§4.10 step 5).
//!
//! Grounded on kannader's own `rustls`/`rustls-pemfile`/`async-tls`/`webpki`
//! stack (`kannader/Cargo.toml`) and on `original_source/lib/qdns_dane.c`
//! for the usage-mode acceptance rule; certificate hashing for DANE
//! matching uses `sha2`, and SPKI extraction for `selector=SPKI` records
//! uses `x509-parser`, both grounded on `wudi-mail-server`'s DANE handling
//! (`crates/smtp/src/outbound/dane/dnssec.rs`, `crates/smtp/Cargo.toml`),
//! the closest in-pack reference for this exact concern.

mod client;
mod server;

pub use client::{build_connector, client_config, ClientTlsError};
pub use server::{build_acceptor, cert_ladder_path, extract_client_identity, server_config, ServerTlsError};
