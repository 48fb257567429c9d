//! Authentication and TLS.

pub mod admin;
#[cfg(feature = "tls")]
pub mod tls;

pub use admin::{hash_password, Credentials, Session};
#[cfg(feature = "tls")]
pub use tls::TlsContext;
