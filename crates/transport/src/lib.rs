//! # Raceway Transport Layer
//!
//! Concrete transports behind the `raceway-core` trait surface:
//!
//! - [`tcp::TcpTransport`] and [`unix::UnixTransport`]: OS sockets muxed
//!   with yamux through the generic transport
//! - [`quic::QuicTransport`]: natively multiplexed QUIC via quinn
//! - [`inproc::InprocTransport`]: fully in-memory transport with its own
//!   address namespace
//!
//! The [`generic`] module is the adapter that turns any single-socket byte
//! transport into a multi-stream connection: raw listen/dial ([`net`]) →
//! ordered connect hooks ([`hooks`]) → stream muxing ([`mux`]).

pub mod generic;
pub mod hooks;
pub mod inproc;
pub mod logging;
pub mod mux;
pub mod net;
pub mod quic;
pub mod tcp;
#[cfg(unix)]
pub mod unix;

pub use generic::GenericTransport;
pub use hooks::{ConnectHook, ConnectHooks, EndpointRole, HookHandle};
pub use inproc::InprocTransport;
pub use mux::{MuxAdapter, MuxConfig, YamuxAdapter};
pub use net::{NetDialer, NetListener, RawConn, RawListener};
pub use quic::QuicTransport;
pub use tcp::TcpTransport;
#[cfg(unix)]
pub use unix::UnixTransport;
