//! Outbound dialers
//!
//! Only the SOCKS5 client is needed: every upstream is an engine exposing a
//! local SOCKS5 port.

pub mod socks5;

pub use socks5::{dial_via, http_get_via};
