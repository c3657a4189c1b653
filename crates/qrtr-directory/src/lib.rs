//! ## QRTR node directory
//!
//! A pure, in-memory map of node id to the services that node exports,
//! indexed both by service id (for "which port hosts service S") and by
//! port (for demultiplexing an inbound packet back to a service id). This
//! crate does no I/O and owns no socket or timer; it is driven entirely by
//! a caller (the bus observer) feeding it `insert_service`/`remove_service`
//! calls decoded from the wire.
//!
//! Unlike a server-side session table shared across worker threads, a
//! directory here is owned exclusively by the single event-loop thread that
//! drives the bus observer, so there is no internal locking.

mod node;

pub use node::{Directory, Node, RemoveOutcome, ServiceEntry};
