//! The bus observer: owns the control socket, drives the `NEW_LOOKUP`
//! handshake, decodes control packets, and maintains the node directory.
//!
//! All state (directory, subscribers, per-node debounce bookkeeping) lives
//! on a single task spawned by [`BusObserver::create`]; [`BusObserver`]
//! itself is a cheap, cloneable handle that talks to that task over an
//! unbounded channel. This gives the "one loop thread, no internal
//! locking" model called for by the concurrency design without pinning the
//! public type to `!Send` — a caller can hold a `BusObserver` anywhere and
//! still only ever touch directory state through the owning task.
//!
//! The decode-and-mutate logic itself lives in [`Core`], which touches no
//! socket and is driven synchronously; [`Inner::run`] is the thin async
//! shell around it that owns the socket and the debounce timers.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use directory::{Directory, Node, RemoveOutcome};
use tokio::sync::{mpsc, oneshot};
use wire::ctrl::{Cmd, CtrlPacket};
use wire::SockAddrQrtr;

use crate::cancel::Cancel;
use crate::error::Error;
use crate::events::{Event, EventHub, SubscriptionToken};
use crate::socket::QrtrSocket;

/// Debounce window a freshly discovered node's service burst is given to
/// settle before it is published to consumers.
pub const PUBLISH_DEBOUNCE_MS: u64 = 100;

enum Command {
    PeekNode(u32, oneshot::Sender<Option<Arc<Node>>>),
    EnumerateNodes(oneshot::Sender<Vec<u32>>),
    Subscribe(oneshot::Sender<(SubscriptionToken, mpsc::UnboundedReceiver<Event>)>),
    Unsubscribe(SubscriptionToken),
    DebounceFired(u32, u64),
}

/// A handle to a running bus observer. Cloning shares the same background
/// task and directory; dropping the last handle (and its subscribers) lets
/// the task exit.
#[derive(Clone)]
pub struct BusObserver {
    commands: mpsc::UnboundedSender<Command>,
    local_node: u32,
}

impl BusObserver {
    /// Drives the startup handshake: opens a control socket, reads its
    /// bound node id, sends `NEW_LOOKUP`, and spawns the decode loop.
    ///
    /// If `lookup_timeout_ms > 0`, waits for the bus to quiesce — the
    /// initial `NEW_SERVER` burst to stop arriving for one debounce window
    /// — before returning, so the directory reflects a settled initial
    /// view. A `lookup_timeout_ms` of `0` returns immediately; the caller
    /// discovers nodes asynchronously via `node-added`.
    ///
    /// Dropping the returned future before it resolves aborts
    /// initialization and closes the socket, per the external-cancellation
    /// policy for this operation — there is no separate cancel parameter
    /// because Rust's async cancel-by-drop already provides it.
    pub async fn create(lookup_timeout_ms: u64) -> Result<Self, Error> {
        let socket = QrtrSocket::open().map_err(Error::SocketCreate)?;
        let local = socket.getsockname().map_err(Error::SocketIO)?;

        if local.sq_family as libc::c_int != wire::AF_QIPCRTR {
            return Err(Error::SocketIO(std::io::Error::other(
                "kernel returned a non-AF_QIPCRTR address for a qrtr socket",
            )));
        }

        socket
            .send_to(
                &CtrlPacket::new_lookup().encode(),
                &SockAddrQrtr::control(local.sq_node),
            )
            .map_err(Error::SocketIO)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (quiesced_tx, quiesced_rx) = oneshot::channel();

        // `Inner::run` only ever needs a *weak* sender to re-enqueue a
        // `DebounceFired` once a timer elapses; holding a strong clone for
        // the task's whole lifetime would keep `commands` open forever, so
        // neither dropping every `BusObserver` handle nor failing out of
        // `create` on timeout (below, before `cmd_tx` is ever handed to a
        // caller) would let the task and its socket exit.
        tokio::spawn(Inner::run(socket, cmd_rx, cmd_tx.downgrade(), Some(quiesced_tx)));

        if lookup_timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(lookup_timeout_ms), quiesced_rx).await
            {
                Ok(_) => {}
                Err(_) => return Err(Error::Timeout),
            }
        }

        Ok(Self {
            commands: cmd_tx,
            local_node: local.sq_node,
        })
    }

    /// The node id the kernel assigned to this process's control socket.
    pub fn local_node(&self) -> u32 {
        self.local_node
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| Error::InvariantViolation("observer task has exited".into()))?;
        rx.await
            .map_err(|_| Error::InvariantViolation("observer task dropped a reply".into()))
    }

    /// Returns a snapshot handle for `id`, or `None` if it is unknown or not
    /// yet published. `peek_node` and `get_node` are the same operation:
    /// the directory never distinguishes a "peek" from a committing read,
    /// since handles are immutable snapshots rather than live cursors.
    pub async fn peek_node(&self, id: u32) -> Result<Option<Arc<Node>>, Error> {
        self.request(|tx| Command::PeekNode(id, tx)).await
    }

    pub async fn get_node(&self, id: u32) -> Result<Option<Arc<Node>>, Error> {
        self.peek_node(id).await
    }

    pub async fn enumerate_nodes(&self) -> Result<Vec<u32>, Error> {
        self.request(Command::EnumerateNodes).await
    }

    /// Subscribes to the observer's full event stream; see [`Event`].
    pub async fn subscribe(
        &self,
    ) -> Result<(SubscriptionToken, mpsc::UnboundedReceiver<Event>), Error> {
        self.request(Command::Subscribe).await
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let _ = self.commands.send(Command::Unsubscribe(token));
    }

    /// Resolves once `id` is published, or completes with `Timeout` /
    /// `Cancelled`. `timeout_ms == 0` waits indefinitely for `cancel` or the
    /// node to appear.
    pub async fn wait_for_node(
        &self,
        id: u32,
        timeout_ms: u64,
        mut cancel: Cancel,
    ) -> Result<Arc<Node>, Error> {
        if let Some(node) = self.peek_node(id).await? {
            return Ok(node);
        }

        let (token, mut events) = self.subscribe().await?;

        // The node may have been published between the first peek and the
        // subscribe call above; re-check before waiting.
        if let Some(node) = self.peek_node(id).await? {
            self.unsubscribe(token);
            return Ok(node);
        }

        let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms.max(1)));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.unsubscribe(token);
                    return Err(Error::Cancelled);
                }

                _ = &mut deadline, if timeout_ms > 0 => {
                    self.unsubscribe(token);
                    return Err(Error::Timeout);
                }

                event = events.recv() => {
                    match event {
                        Some(Event::NodeAdded(added)) if added == id => {
                            self.unsubscribe(token);
                            return self
                                .peek_node(id)
                                .await?
                                .ok_or_else(|| Error::InvariantViolation(
                                    "node-added fired but the node is missing".into(),
                                ));
                        }
                        Some(_) => continue,
                        None => {
                            return Err(Error::InvariantViolation(
                                "observer event stream closed".into(),
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// The decode-and-mutate core: directory, event hub, and per-node debounce
/// generations. Touches no socket, so it can be driven synchronously in
/// tests without an `AF_QIPCRTR` socket, which most sandboxes and CI
/// runners cannot open.
struct Core {
    directory: Directory,
    hub: EventHub,
    debounce_generation: AHashMap<u32, u64>,
    next_generation: u64,
}

impl Core {
    fn new() -> Self {
        Self {
            directory: Directory::new(),
            hub: EventHub::new(),
            debounce_generation: AHashMap::new(),
            next_generation: 0,
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::PeekNode(id, reply) => {
                let _ = reply.send(self.directory.get_node(id));
            }
            Command::EnumerateNodes(reply) => {
                let _ = reply.send(self.directory.enumerate_nodes());
            }
            Command::Subscribe(reply) => {
                let (token, rx) = self.hub.subscribe();
                let _ = reply.send((token, rx));
            }
            Command::Unsubscribe(token) => self.hub.unsubscribe(token),
            Command::DebounceFired(node_id, generation) => self.debounce_fired(node_id, generation),
        }
    }

    /// Decodes and applies one control packet. Returns `Some((node_id,
    /// generation))` when the caller (the async loop) needs to arm a fresh
    /// debounce timer for that node.
    fn on_datagram(&mut self, bytes: &[u8]) -> Option<(u32, u64)> {
        let packet = match CtrlPacket::decode(bytes) {
            Ok(packet) => packet,
            Err(_) => {
                log::debug!("dropping short qrtr control packet ({} bytes)", bytes.len());
                return None;
            }
        };

        match packet.cmd {
            Cmd::NewServer => self.on_new_server(packet),
            Cmd::DelServer => {
                self.on_del_server(packet);
                None
            }
            Cmd::NewLookup => None,
            Cmd::Unknown(cmd) => {
                log::debug!("dropping unknown qrtr control command {cmd}");
                None
            }
        }
    }

    fn on_new_server(&mut self, packet: CtrlPacket) -> Option<(u32, u64)> {
        let p = packet.payload;
        let node_id = p.node;

        self.directory
            .insert_service(node_id, p.port, p.service, p.version(), p.instance());
        self.hub.emit(Event::ServiceAdded(node_id, p.service));

        if self.directory.is_published(node_id) {
            return None;
        }

        // A single process-wide monotonic counter, not a per-node one: a
        // node that empties and is re-advertised must never be re-armed
        // with a generation value a still-pending timer from its earlier
        // life could also match.
        self.next_generation += 1;
        let generation = self.next_generation;
        self.debounce_generation.insert(node_id, generation);
        Some((node_id, generation))
    }

    fn on_del_server(&mut self, packet: CtrlPacket) {
        let p = packet.payload;
        let node_id = p.node;

        if !self.directory.contains(node_id) {
            log::warn!("dropping DEL_SERVER for unknown node {node_id}");
            return;
        }

        let was_published = self.directory.is_published(node_id);

        match self.directory.remove_service(node_id, p.port, p.service) {
            RemoveOutcome::Unknown => {
                log::warn!("dropping DEL_SERVER for unknown port {} on node {node_id}", p.port);
            }
            RemoveOutcome::Removed => {
                self.hub.emit(Event::ServiceRemoved(node_id, p.service));
            }
            RemoveOutcome::NodeEmptied => {
                self.hub.emit(Event::ServiceRemoved(node_id, p.service));

                if was_published {
                    self.hub.emit(Event::NodeRemoved(node_id));
                }

                self.directory.remove_node(node_id);
                self.debounce_generation.remove(&node_id);
            }
        }
    }

    /// Applies a debounce timer firing. A no-op if the node was removed or
    /// re-armed (a newer generation recorded) since this timer was started.
    fn debounce_fired(&mut self, node_id: u32, generation: u64) {
        if self.debounce_generation.get(&node_id) == Some(&generation)
            && self.directory.mark_published(node_id)
        {
            self.hub.emit(Event::NodeAdded(node_id));
        }
    }
}

struct Inner {
    socket: QrtrSocket,
    core: Core,
}

impl Inner {
    async fn run(
        socket: QrtrSocket,
        mut commands: mpsc::UnboundedReceiver<Command>,
        self_tx: mpsc::WeakUnboundedSender<Command>,
        mut quiesced: Option<oneshot::Sender<()>>,
    ) {
        let mut inner = Inner {
            socket,
            core: Core::new(),
        };

        let mut buf = [0u8; wire::ctrl::CTRL_PACKET_SIZE];
        let quiescence = tokio::time::sleep(Duration::from_millis(PUBLISH_DEBOUNCE_MS));
        tokio::pin!(quiescence);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => inner.core.handle_command(cmd),
                        None => return,
                    }
                }

                result = inner.socket.recv(&mut buf) => {
                    match result {
                        Ok(n) => {
                            if let Some((node_id, generation)) = inner.core.on_datagram(&buf[..n]) {
                                // Upgrade only for the lifetime of the spawned
                                // timer task: holding a strong sender across
                                // the whole idle loop would keep `commands`
                                // open forever and the task could never exit
                                // once every `BusObserver` handle was dropped.
                                if let Some(tx) = self_tx.upgrade() {
                                    tokio::spawn(async move {
                                        tokio::time::sleep(Duration::from_millis(PUBLISH_DEBOUNCE_MS)).await;
                                        let _ = tx.send(Command::DebounceFired(node_id, generation));
                                    });
                                }
                            }

                            if quiesced.is_some() {
                                quiescence
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + Duration::from_millis(PUBLISH_DEBOUNCE_MS));
                            }
                        }
                        Err(e) => {
                            log::error!("qrtr control socket read failed, observer stopping: {e}");
                            return;
                        }
                    }
                }

                _ = &mut quiescence, if quiesced.is_some() => {
                    if let Some(tx) = quiesced.take() {
                        let _ = tx.send(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::ctrl::Payload;

    fn new_server(node: u32, port: u32, service: u32, version: u8, instance: u32) -> CtrlPacket {
        CtrlPacket {
            cmd: Cmd::NewServer,
            payload: Payload {
                service,
                node,
                port,
                instance_raw: Payload::pack(version, instance),
            },
        }
    }

    fn del_server(node: u32, port: u32, service: u32) -> CtrlPacket {
        CtrlPacket {
            cmd: Cmd::DelServer,
            payload: Payload {
                service,
                node,
                port,
                instance_raw: 0,
            },
        }
    }

    fn encode(pkt: &CtrlPacket) -> [u8; wire::ctrl::CTRL_PACKET_SIZE] {
        pkt.encode()
    }

    /// Drives a [`Core`] the same way [`Inner::run`] does, except datagrams
    /// are injected over a channel instead of read from a real `AF_QIPCRTR`
    /// socket, which most sandboxes and CI runners cannot open. Lets
    /// `wait_for_node` be exercised against the full `BusObserver` surface
    /// (S4/S5) without a kernel QRTR driver.
    async fn run_core_without_socket(
        mut commands: mpsc::UnboundedReceiver<Command>,
        self_tx: mpsc::UnboundedSender<Command>,
        mut datagrams: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let mut core = Core::new();

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => core.handle_command(cmd),
                        None => return,
                    }
                }

                dgram = datagrams.recv() => {
                    match dgram {
                        Some(bytes) => {
                            if let Some((node_id, generation)) = core.on_datagram(&bytes) {
                                let tx = self_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(Duration::from_millis(PUBLISH_DEBOUNCE_MS)).await;
                                    let _ = tx.send(Command::DebounceFired(node_id, generation));
                                });
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    fn spawn_observer_without_socket() -> (BusObserver, mpsc::UnboundedSender<Vec<u8>>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dgram_tx, dgram_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_core_without_socket(cmd_rx, cmd_tx.clone(), dgram_rx));

        (
            BusObserver {
                commands: cmd_tx,
                local_node: 0,
            },
            dgram_tx,
        )
    }

    // S4 — wait_for_node times out when the target node never appears, and
    // emits no node-added.
    #[tokio::test(start_paused = true)]
    async fn wait_for_node_times_out_when_node_never_appears() {
        let (observer, _dgrams) = spawn_observer_without_socket();

        let result = observer.wait_for_node(99, 50, Cancel::never()).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    // S5 — wait_for_node resolves once the target node is published, even
    // if it only appears on the bus after the wait has started.
    #[tokio::test(start_paused = true)]
    async fn wait_for_node_resolves_after_late_publish() {
        let (observer, dgrams) = spawn_observer_without_socket();

        let waiter = tokio::spawn({
            let observer = observer.clone();
            async move { observer.wait_for_node(42, 10_000, Cancel::never()).await }
        });

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(200)).await;

        dgrams
            .send(encode(&new_server(42, 1, 1, 0, 0)).to_vec())
            .unwrap();
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(PUBLISH_DEBOUNCE_MS + 10)).await;

        let node = waiter.await.unwrap().unwrap();
        assert_eq!(node.node_id(), 42);
    }

    // wait_for_node returns immediately, without subscribing, when the
    // target node is already published.
    #[tokio::test]
    async fn wait_for_node_resolves_synchronously_for_already_published_node() {
        let (observer, dgrams) = spawn_observer_without_socket();

        dgrams
            .send(encode(&new_server(1, 1, 1, 0, 0)).to_vec())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(PUBLISH_DEBOUNCE_MS + 20)).await;

        let node = observer
            .wait_for_node(1, 1_000, Cancel::never())
            .await
            .unwrap();
        assert_eq!(node.node_id(), 1);
    }

    // Cancellation wins a simultaneous race against a node-added event, and
    // wait_for_node completes exactly once with Cancelled.
    #[tokio::test(start_paused = true)]
    async fn wait_for_node_honors_cancellation() {
        let (observer, _dgrams) = spawn_observer_without_socket();
        let (cancel_handle, cancel) = crate::cancel::cancel_pair();

        let waiter = tokio::spawn({
            let observer = observer.clone();
            async move { observer.wait_for_node(7, 0, cancel).await }
        });

        tokio::task::yield_now().await;
        cancel_handle.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    // S1 — single node, single service: service-added precedes node-added,
    // and lookups resolve once the debounce fires.
    #[test]
    fn single_node_single_service_publishes_after_debounce() {
        let mut core = Core::new();
        let (_token, mut events) = core.hub.subscribe();

        let bytes = encode(&new_server(5, 10, 100, 1, 0));
        let armed = core.on_datagram(&bytes);
        assert_eq!(events.try_recv().unwrap(), Event::ServiceAdded(5, 100));
        assert!(core.directory.get_node(5).is_none());

        let (node_id, generation) = armed.expect("unpublished node arms a debounce");
        core.debounce_fired(node_id, generation);

        assert_eq!(events.try_recv().unwrap(), Event::NodeAdded(5));
        assert!(core.directory.get_node(5).is_some());
        assert_eq!(core.directory.lookup_port(5, 100), Some(10));
        assert_eq!(core.directory.lookup_service(5, 10), Some(100));
    }

    // S2 — version preference: the highest-version entry wins regardless
    // of arrival order.
    #[test]
    fn highest_version_entry_is_preferred() {
        let mut core = Core::new();

        core.on_datagram(&encode(&new_server(7, 20, 200, 1, 0)));
        let armed = core.on_datagram(&encode(&new_server(7, 21, 200, 3, 0)));
        core.on_datagram(&encode(&new_server(7, 22, 200, 2, 0)));

        let (node_id, generation) = armed.unwrap();
        core.debounce_fired(node_id, generation);

        assert_eq!(core.directory.lookup_port(7, 200), Some(21));
    }

    // S3 — remove sequence: service-removed then node-removed, in order,
    // and the node disappears from lookups.
    #[test]
    fn remove_sequence_emits_service_then_node_removed() {
        let mut core = Core::new();
        let (_token, mut events) = core.hub.subscribe();

        let armed = core.on_datagram(&encode(&new_server(5, 10, 100, 1, 0)));
        events.try_recv().unwrap(); // service-added
        let (node_id, generation) = armed.unwrap();
        core.debounce_fired(node_id, generation);
        events.try_recv().unwrap(); // node-added

        core.on_datagram(&encode(&del_server(5, 10, 100)));

        assert_eq!(events.try_recv().unwrap(), Event::ServiceRemoved(5, 100));
        assert_eq!(events.try_recv().unwrap(), Event::NodeRemoved(5));
        assert!(core.directory.get_node(5).is_none());
        assert!(!core.directory.contains(5));
    }

    // S6 — unpublished removal: a DEL_SERVER arriving before the debounce
    // fires empties the node without ever emitting node-added/node-removed.
    #[test]
    fn unpublished_removal_emits_no_node_events() {
        let mut core = Core::new();
        let (_token, mut events) = core.hub.subscribe();

        core.on_datagram(&encode(&new_server(8, 30, 300, 1, 0)));
        events.try_recv().unwrap(); // service-added

        core.on_datagram(&encode(&del_server(8, 30, 300)));
        assert_eq!(events.try_recv().unwrap(), Event::ServiceRemoved(8, 300));
        assert!(events.try_recv().is_err());

        assert!(!core.directory.contains(8));
    }

    // S7 — stray delete: a DEL_SERVER for a node the directory never heard
    // of is a silent no-op.
    #[test]
    fn stray_delete_for_unknown_node_is_a_no_op() {
        let mut core = Core::new();
        let (_token, mut events) = core.hub.subscribe();

        core.on_datagram(&encode(&del_server(9, 99, 999)));

        assert!(events.try_recv().is_err());
        assert!(!core.directory.contains(9));
    }

    // A debounce timer that fires after the node was re-armed by a later
    // burst must not publish early — only the newest generation counts.
    #[test]
    fn stale_debounce_generation_does_not_publish() {
        let mut core = Core::new();

        let first = core.on_datagram(&encode(&new_server(3, 1, 11, 1, 0))).unwrap();
        let second = core.on_datagram(&encode(&new_server(3, 2, 11, 1, 0))).unwrap();
        assert_ne!(first.1, second.1);

        core.debounce_fired(first.0, first.1);
        assert!(core.directory.get_node(3).is_none());

        core.debounce_fired(second.0, second.1);
        assert!(core.directory.get_node(3).is_some());
    }

    // A node that empties and is re-advertised must get a generation value
    // no earlier, still-pending timer from its first life can match — the
    // per-node counter used to reset to 1 on every fresh advertisement,
    // letting a stale timer from the first burst publish the second burst
    // before its own debounce window elapsed.
    #[test]
    fn generation_is_not_reused_after_node_is_emptied_and_readvertised() {
        let mut core = Core::new();

        let first_life = core
            .on_datagram(&encode(&new_server(4, 1, 5, 1, 0)))
            .unwrap();

        core.on_datagram(&encode(&del_server(4, 1, 5)));
        assert!(!core.directory.contains(4));

        let second_life = core
            .on_datagram(&encode(&new_server(4, 2, 6, 1, 0)))
            .unwrap();
        assert_ne!(first_life.1, second_life.1);

        core.debounce_fired(first_life.0, first_life.1);
        assert!(
            core.directory.get_node(4).is_none(),
            "a stale timer from the node's first life must not publish its second life"
        );

        core.debounce_fired(second_life.0, second_life.1);
        assert!(core.directory.get_node(4).is_some());
    }
}
