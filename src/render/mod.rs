//! Config renderers
//!
//! Pure text generation for the routing daemon and the tunnel toolchain.
//! All renderers are deterministic: stable ordering, no timestamps, so that
//! the reconciler can diff expected text against on-disk text byte for byte.

pub mod bird;
pub mod wireguard;
