//! ## qrtr
//!
//! A userspace client library for the Qualcomm IPC Router (QRTR) bus
//! (`AF_QIPCRTR`, family 42) used on Qualcomm modem and SoC platforms to
//! locate and talk to services exported by remote processors.
//!
//! Two subsystems do the real work:
//!
//! - [`observer::BusObserver`] owns the control socket, drives the kernel
//!   lookup handshake, decodes `NEW_SERVER`/`DEL_SERVER` packets, and
//!   publishes a debounced view of nodes and the services they export.
//! - [`channel::ClientChannel`] is a per-`(node, port)` datagram conduit an
//!   application uses to exchange raw messages with one service.
//!
//! The wire format lives in the `qrtr-wire` crate and the pure node/service
//! index in `qrtr-directory`; this crate wires both into an async event
//! loop built on `tokio`.

pub mod cancel;
pub mod channel;
pub mod error;
pub mod events;
pub mod observer;
mod socket;

pub use cancel::{Cancel, CancelHandle, cancel_pair};
pub use channel::ClientChannel;
pub use directory::{Node, ServiceEntry};
pub use error::Error;
pub use events::{Event, SubscriptionToken};
pub use observer::{BusObserver, PUBLISH_DEBOUNCE_MS};
