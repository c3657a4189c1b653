use std::sync::Arc;

use ahash::AHashMap;

/// A single `(service_id, port)` advertisement for one node. Immutable once
/// created; uniquely keyed by `port` within its owning [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_id: u32,
    pub port: u32,
    pub version: u8,
    pub instance: u32,
}

/// Everything the directory knows about one node.
///
/// `services` preserves insertion order for enumeration; `by_service` is
/// kept sorted ascending by `version` so the highest-version entry — the
/// "preferred" one — is always the last element; `by_port` is the reverse
/// map used to demultiplex an inbound datagram's source port back to a
/// service id.
#[derive(Debug, Clone, Default)]
pub struct Node {
    node_id: u32,
    services: Vec<ServiceEntry>,
    by_service: AHashMap<u32, Vec<ServiceEntry>>,
    by_port: AHashMap<u32, ServiceEntry>,
    published: bool,
}

impl Node {
    fn new(node_id: u32) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    /// All service entries in the order they were first advertised.
    pub fn services(&self) -> &[ServiceEntry] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Port of the highest-version entry for `service_id` on this node.
    pub fn lookup_port(&self, service_id: u32) -> Option<u32> {
        self.by_service.get(&service_id)?.last().map(|e| e.port)
    }

    /// Service id hosted at `port` on this node.
    pub fn lookup_service(&self, port: u32) -> Option<u32> {
        self.by_port.get(&port).map(|e| e.service_id)
    }

    fn insert_service(&mut self, entry: ServiceEntry) {
        self.by_port.insert(entry.port, entry);

        let versions = self.by_service.entry(entry.service_id).or_default();
        versions.push(entry);
        versions.sort_by_key(|e| e.version);

        self.services.push(entry);
    }

    /// Removes the entry identified by `port`. Returns `None` if `port` was
    /// never advertised by this node — the caller (the bus observer) treats
    /// that as a stray `DEL_SERVER` and logs a warning rather than panicking.
    fn remove_service(&mut self, port: u32) -> Option<ServiceEntry> {
        let entry = self.by_port.remove(&port)?;

        if let Some(versions) = self.by_service.get_mut(&entry.service_id) {
            versions.retain(|e| e.port != port);
            if versions.is_empty() {
                self.by_service.remove(&entry.service_id);
            }
        }

        self.services.retain(|e| e.port != port);
        Some(entry)
    }
}

/// Outcome of [`Directory::remove_service`], distinguishing a stray delete
/// for an unknown `(node, port)` from a successful removal that did or did
/// not leave the node empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The service was removed; the node still advertises others.
    Removed,
    /// The service was removed and the node has no services left.
    NodeEmptied,
    /// `(node, port)` was not known to the directory; no-op.
    Unknown,
}

/// In-memory map of `node_id -> Node`. Pure data: no sockets, no timers, no
/// background threads. See the crate's module documentation for why this
/// carries no internal locking, unlike a multi-threaded session table.
#[derive(Debug, Default)]
pub struct Directory {
    nodes: AHashMap<u32, Node>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the node record if absent (unpublished) and inserts the
    /// service entry. The wire contract guarantees the kernel never issues
    /// the same `(node, port)` twice; this method does not itself guard
    /// against duplicate inserts, matching that contract rather than paying
    /// for a check the caller is responsible for satisfying.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_directory::Directory;
    ///
    /// let mut dir = Directory::new();
    /// dir.insert_service(5, 10, 100, 1, 0);
    ///
    /// assert_eq!(dir.lookup_port(5, 100), Some(10));
    /// assert_eq!(dir.lookup_service(5, 10), Some(100));
    /// ```
    pub fn insert_service(&mut self, node_id: u32, port: u32, service_id: u32, version: u8, instance: u32) {
        let node = self
            .nodes
            .entry(node_id)
            .or_insert_with(|| Node::new(node_id));

        node.insert_service(ServiceEntry {
            service_id,
            port,
            version,
            instance,
        });
    }

    /// Removes the entry identified by `port`, ignoring `service_id` for the
    /// lookup itself (a port uniquely identifies the entry; `service_id` is
    /// accepted for symmetry with the wire's `DEL_SERVER` payload and is not
    /// separately validated).
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_directory::{Directory, RemoveOutcome};
    ///
    /// let mut dir = Directory::new();
    /// dir.insert_service(5, 10, 100, 1, 0);
    ///
    /// assert_eq!(dir.remove_service(5, 10, 100), RemoveOutcome::NodeEmptied);
    /// assert_eq!(dir.remove_service(9, 99, 999), RemoveOutcome::Unknown);
    /// ```
    pub fn remove_service(&mut self, node_id: u32, port: u32, _service_id: u32) -> RemoveOutcome {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return RemoveOutcome::Unknown;
        };

        match node.remove_service(port) {
            None => RemoveOutcome::Unknown,
            Some(_) if node.is_empty() => RemoveOutcome::NodeEmptied,
            Some(_) => RemoveOutcome::Removed,
        }
    }

    /// Returns the port of the highest-version entry for `service_id` on
    /// `node_id`.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_directory::Directory;
    ///
    /// let mut dir = Directory::new();
    /// dir.insert_service(7, 20, 200, 1, 0);
    /// dir.insert_service(7, 21, 200, 3, 0);
    /// dir.insert_service(7, 22, 200, 2, 0);
    ///
    /// assert_eq!(dir.lookup_port(7, 200), Some(21));
    /// ```
    pub fn lookup_port(&self, node_id: u32, service_id: u32) -> Option<u32> {
        self.nodes
            .get(&node_id)?
            .by_service
            .get(&service_id)?
            .last()
            .map(|entry| entry.port)
    }

    /// Returns the service id hosted at `port` on `node_id`.
    pub fn lookup_service(&self, node_id: u32, port: u32) -> Option<u32> {
        self.nodes
            .get(&node_id)?
            .by_port
            .get(&port)
            .map(|entry| entry.service_id)
    }

    /// Snapshot list of published node ids, in no particular order.
    pub fn enumerate_nodes(&self) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|node| node.published)
            .map(|node| node.node_id)
            .collect()
    }

    pub fn contains(&self, node_id: u32) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn is_published(&self, node_id: u32) -> bool {
        self.nodes.get(&node_id).is_some_and(|n| n.published)
    }

    /// Flips `published` to `true`. Returns `true` if this call performed
    /// the `false -> true` transition (i.e. the observer should emit
    /// `node-added`), `false` if the node was already published or is
    /// absent (e.g. it was removed before its debounce timer fired).
    pub fn mark_published(&mut self, node_id: u32) -> bool {
        match self.nodes.get_mut(&node_id) {
            Some(node) if !node.published => {
                node.published = true;
                true
            }
            _ => false,
        }
    }

    /// Drops the node record entirely. Used once `remove_service` reports
    /// [`RemoveOutcome::NodeEmptied`], after the caller has read whatever it
    /// needed (e.g. `was_published`) from the record.
    pub fn remove_node(&mut self, node_id: u32) {
        self.nodes.remove(&node_id);
    }

    /// A reference-counted snapshot of the node's current state, or `None`
    /// if the node is unknown or not yet published. Respects invariant 5:
    /// unpublished records are internal-only.
    ///
    /// # Test
    ///
    /// ```
    /// use qrtr_directory::Directory;
    ///
    /// let mut dir = Directory::new();
    /// dir.insert_service(5, 10, 100, 1, 0);
    /// assert!(dir.get_node(5).is_none()); // not published yet
    ///
    /// dir.mark_published(5);
    /// assert!(dir.get_node(5).is_some());
    /// ```
    pub fn get_node(&self, node_id: u32) -> Option<Arc<Node>> {
        self.nodes
            .get(&node_id)
            .filter(|node| node.published)
            .map(|node| Arc::new(node.clone()))
    }
}
