//! The tube manager: owns the v4/v6 socket pair, demultiplexes incoming
//! datagrams onto tubes by id, drives the per-tube state machine, and runs
//! the single-threaded wait loop that ties sockets, the timer queue, and the
//! self-pipe together.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{Dispatcher, Event, EventKind};
use crate::id::{self, TubeId, TubeIdBuildHasher};
use crate::pktinfo::Pktinfo;
use crate::signal::{self, SelfPipe, WakeReason};
use crate::socket::{AsyncDatagram, DatagramIo, Family, RawSocket};
use crate::timer::{TimerId, TimerQueue};
use crate::tube::{Role, Tube, TubeState};
use crate::wire::{self, cbor::Value, Command, Header};

type TubeTable = std::collections::HashMap<TubeId, Tube, TubeIdBuildHasher>;

/// Construction-time knobs for a [`TubeManager`], gathered behind a builder
/// rather than a long constructor argument list.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    port: u16,
    responder: bool,
    table_capacity: usize,
    bind_v4: bool,
    bind_v6: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            responder: false,
            table_capacity: 64,
            bind_v4: true,
            bind_v6: true,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Whether this manager accepts OPENs from unknown ids (auto-creating a
    /// tube) rather than only ever initiating tubes itself.
    pub fn responder(mut self, responder: bool) -> Self {
        self.responder = responder;
        self
    }

    /// Capacity hint for the tube table, replacing the original's raw
    /// hash-table bucket count.
    pub fn table_capacity(mut self, capacity: usize) -> Self {
        self.table_capacity = capacity.max(1);
        self
    }

    pub fn bind_v4(mut self, enabled: bool) -> Self {
        self.bind_v4 = enabled;
        self
    }

    pub fn bind_v6(mut self, enabled: bool) -> Self {
        self.bind_v6 = enabled;
        self
    }
}

/// Thin wrapper so an `Arc<RawSocket>` can be shared between the sync send
/// path and an `AsyncFd`-wrapped receive path without duplicating the fd.
#[derive(Clone)]
struct SocketRef(std::sync::Arc<RawSocket>);

impl AsRawFd for SocketRef {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl DatagramIo for SocketRef {
    fn try_send_to(
        &self,
        addr: SocketAddr,
        buf: &[u8],
        pktinfo: Option<&Pktinfo>,
    ) -> std::io::Result<usize> {
        self.0.try_send_to(addr, buf, pktinfo)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, Pktinfo)> {
        self.0.try_recv_from(buf)
    }
}

/// State shared between the manager and every [`ManagerHandle`] clone:
/// sockets (for sending), the timer queue, and the self-pipe. Does not own
/// the tube table — only the loop thread touches that.
struct ManagerShared {
    v4: Option<std::sync::Arc<RawSocket>>,
    v6: Option<std::sync::Arc<RawSocket>>,
    pipe: SelfPipe,
    timers: TimerQueue,
}

impl ManagerShared {
    fn socket_for(&self, addr: SocketAddr) -> Result<&RawSocket> {
        match addr {
            SocketAddr::V4(_) => self
                .v4
                .as_deref()
                .ok_or_else(|| Error::invalid_state("no v4 socket bound")),
            SocketAddr::V6(_) => self
                .v6
                .as_deref()
                .ok_or_else(|| Error::invalid_state("no v6 socket bound")),
        }
    }
}

/// A cloneable, non-owning reference to a running manager's send/scheduling
/// surface. Tubes hold one of these instead of a back-pointer to the
/// manager itself.
#[derive(Clone)]
pub struct ManagerHandle {
    shared: std::sync::Arc<ManagerShared>,
}

impl ManagerHandle {
    /// Encode and send a packet to `peer` over whichever bound socket
    /// matches its address family, attaching `pktinfo` as source-address
    /// ancillary data when the caller has one (a reply over a
    /// responder-created tube reusing the peer's originally targeted local
    /// address).
    pub fn send_to(
        &self,
        peer: SocketAddr,
        header: &Header,
        payload: Option<&Value>,
        pktinfo: Option<&Pktinfo>,
    ) -> Result<()> {
        let socket = self.shared.socket_for(peer)?;
        let bytes = wire::encode(header, payload);
        socket.try_send_to(peer, &bytes, pktinfo)?;
        Ok(())
    }

    pub fn schedule_at(&self, deadline: std::time::Instant, callback: impl FnOnce() + Send + 'static) -> TimerId {
        self.shared.timers.push_at(deadline, callback)
    }

    pub fn schedule_ms(&self, delay_ms: u64, callback: impl FnOnce() + Send + 'static) -> TimerId {
        self.shared.timers.push_in(Duration::from_millis(delay_ms), callback)
    }

    /// Wake the loop without it needing any socket or timer activity.
    /// Safe to call from any thread.
    pub fn interrupt(&self) {
        self.shared.pipe.wake(WakeReason::Interrupt);
    }

    /// Register `signal` so its delivery wakes this manager's loop and,
    /// once the loop thread drains that wake, runs `callback` there.
    pub fn watch_signal(
        &self,
        signal: i32,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<signal_hook::SigId> {
        signal::register(signal, &self.shared.pipe, callback)
    }
}

/// Owns the socket pair, the tube table, and the event dispatcher; runs the
/// single-threaded wait loop.
pub struct TubeManager {
    shared: std::sync::Arc<ManagerShared>,
    v4_async: Option<AsyncDatagram<SocketRef>>,
    v6_async: Option<AsyncDatagram<SocketRef>>,
    pipe_fd: AsyncFd<BorrowedPipeFd>,
    tubes: TubeTable,
    dispatcher: Dispatcher,
    config: ManagerConfig,
    running: bool,
}

/// `AsyncFd` needs to own something `AsRawFd`; the self-pipe's read end is
/// owned by `ManagerShared`, so this just borrows the raw fd value (stable
/// for the self-pipe's lifetime, which outlives the manager's loop).
struct BorrowedPipeFd(RawFd);

impl AsRawFd for BorrowedPipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl TubeManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let v4 = if config.bind_v4 {
            Some(std::sync::Arc::new(RawSocket::bind(Family::V4, config.port)?))
        } else {
            None
        };
        let v6 = if config.bind_v6 {
            Some(std::sync::Arc::new(RawSocket::bind(Family::V6, config.port)?))
        } else {
            None
        };

        let pipe = SelfPipe::new()?;
        let pipe_raw_fd = pipe.as_raw_fd();

        let shared = std::sync::Arc::new(ManagerShared {
            v4: v4.clone(),
            v6: v6.clone(),
            pipe,
            timers: TimerQueue::new(),
        });

        let v4_async = v4
            .map(|s| AsyncDatagram::new(SocketRef(s)))
            .transpose()?;
        let v6_async = v6
            .map(|s| AsyncDatagram::new(SocketRef(s)))
            .transpose()?;

        info!(port = config.port, responder = config.responder, "tube manager bound");

        Ok(Self {
            shared,
            v4_async,
            v6_async,
            pipe_fd: AsyncFd::new(BorrowedPipeFd(pipe_raw_fd))?,
            tubes: TubeTable::with_capacity_and_hasher(config.table_capacity, TubeIdBuildHasher::default()),
            dispatcher: Dispatcher::new(),
            config,
            running: true,
        })
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            shared: std::sync::Arc::clone(&self.shared),
        }
    }

    pub fn len(&self) -> usize {
        self.tubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }

    pub fn is_responder(&self) -> bool {
        self.config.responder
    }

    pub fn bind_event(&mut self, name: &str, callback: Box<dyn FnMut(&Event) + Send>) -> Result<()> {
        self.dispatcher.bind(name, callback)
    }

    /// Register a new tube, assumed called only from the loop thread.
    pub fn add(&mut self, mut tube: Tube) -> TubeId {
        let id = tube.id();
        tube.set_manager(self.handle());
        self.tubes.insert(id, tube);
        self.dispatcher.fire(Event::new(EventKind::Add, Some(id)));
        id
    }

    /// Deregister a tube, assumed called only from the loop thread.
    pub fn remove(&mut self, id: TubeId) -> Option<Tube> {
        let removed = self.tubes.remove(&id);
        if removed.is_some() {
            self.dispatcher.fire(Event::new(EventKind::Remove, Some(id)));
        }
        removed
    }

    pub fn get(&self, id: TubeId) -> Option<&Tube> {
        self.tubes.get(&id)
    }

    pub fn get_mut(&mut self, id: TubeId) -> Option<&mut Tube> {
        self.tubes.get_mut(&id)
    }

    /// The ephemeral or configured port the v4 socket bound to, if one was
    /// opened.
    pub fn local_v4_port(&self) -> Option<u16> {
        self.shared.v4.as_ref().and_then(|s| s.local_port().ok())
    }

    /// The ephemeral or configured port the v6 socket bound to, if one was
    /// opened.
    pub fn local_v6_port(&self) -> Option<u16> {
        self.shared.v6.as_ref().and_then(|s| s.local_port().ok())
    }

    /// Create a tube, transition it to OPENING, and send its OPEN, matching
    /// `tube_manager_open_tube`.
    pub fn open_tube(&mut self, peer: SocketAddr) -> Result<TubeId> {
        let tube_id = id::new_id()?;
        let mut tube = Tube::new(tube_id, Role::Initiator);
        tube.set_info(peer);
        tube.set_manager(self.handle());
        tube.open()?;
        self.add(tube);
        Ok(tube_id)
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.shared.pipe.wake(WakeReason::Stop);
    }

    /// Run the wait loop until `stop` is called. Examines the v6 socket
    /// before v4 every iteration, matching the original's `select()` FD_SET
    /// ordering and its resulting (accepted) v4-starvation behavior under
    /// sustained v6 load.
    pub async fn run(&mut self) -> Result<()> {
        self.dispatcher.fire(Event::new(EventKind::LoopStart, None));

        while self.running {
            self.shared.timers.run_due();
            let timeout = self
                .shared
                .timers
                .next_timeout()
                .unwrap_or(Duration::from_secs(3600));

            let mut v6_buf = [0u8; 2048];
            let mut v4_buf = [0u8; 2048];

            tokio::select! {
                biased;

                result = recv_on(&self.v6_async, &mut v6_buf), if self.v6_async.is_some() => {
                    self.handle_datagram(result?, &v6_buf);
                }
                result = recv_on(&self.v4_async, &mut v4_buf), if self.v4_async.is_some() => {
                    self.handle_datagram(result?, &v4_buf);
                }
                result = self.pipe_fd.ready(Interest::READABLE) => {
                    let mut guard = result?;
                    guard.clear_ready();
                    for reason in self.shared.pipe.drain() {
                        match reason {
                            WakeReason::Stop => self.running = false,
                            WakeReason::Interrupt => debug!("loop interrupted"),
                            WakeReason::Signal(sig) => {
                                debug!(signal = sig, "loop woken by signal");
                                signal::dispatch(sig, self.shared.pipe.write_fd());
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(timeout) => {}
            }
        }
        Ok(())
    }

    fn handle_datagram(&mut self, result: (usize, SocketAddr, Pktinfo), buf: &[u8]) {
        let (n, peer, pktinfo) = result;
        let datagram = &buf[..n];

        if !wire::is_spud(datagram) {
            debug!(len = n, "ignored non-SPUD datagram");
            return;
        }

        let packet = match wire::parse(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "dropping malformed SPUD datagram");
                return;
            }
        };

        self.dispatch(packet.header, packet.payload, peer, pktinfo);
    }

    fn dispatch(&mut self, header: Header, payload: Option<Value>, peer: SocketAddr, pktinfo: Pktinfo) {
        let id = header.tube_id;
        match header.command {
            Command::Open => self.on_open(id, peer, pktinfo),
            Command::Ack => self.on_ack(id),
            Command::Data => self.on_data(id, payload),
            Command::Close => self.on_close(id),
        }
    }

    fn on_open(&mut self, id: TubeId, peer: SocketAddr, pktinfo: Pktinfo) {
        match self.tubes.get(&id).map(|t| t.state()) {
            Some(_) => {
                // A second OPEN for an id we already have a tube for —
                // whether RUNNING, OPENING, or otherwise — is a no-op per
                // §3's "duplicate OPEN/ACK" idempotency rule; no re-ACK, no
                // repeated events.
            }
            None => {
                if !self.config.responder {
                    debug!("ignoring OPEN: manager is not a responder");
                    return;
                }
                let mut tube = Tube::new(id, Role::Responder);
                tube.set_info(peer);
                tube.set_local(pktinfo);
                tube.set_state(TubeState::Running);
                let tube_id = self.add(tube);
                if let Some(tube) = self.tubes.get(&tube_id) {
                    if let Err(err) = tube.ack() {
                        warn!(error = %err, "failed to ack new tube");
                    }
                }
                self.dispatcher.fire(Event::new(EventKind::Running, Some(tube_id)));
            }
        }
    }

    fn on_ack(&mut self, id: TubeId) {
        if let Some(tube) = self.tubes.get_mut(&id) {
            if tube.state() == TubeState::Opening {
                tube.set_state(TubeState::Running);
                self.dispatcher.fire(Event::new(EventKind::Running, Some(id)));
            }
        }
    }

    fn on_data(&mut self, id: TubeId, payload: Option<Value>) {
        if let Some(tube) = self.tubes.get(&id) {
            if tube.state() == TubeState::Running {
                self.dispatcher.fire(Event::data(id, payload));
            }
        }
    }

    fn on_close(&mut self, id: TubeId) {
        let should_fire = matches!(
            self.tubes.get(&id).map(|t| t.state()),
            Some(state) if state != TubeState::Unknown
        );
        if should_fire {
            if let Some(tube) = self.tubes.get_mut(&id) {
                tube.set_state(TubeState::Unknown);
            }
            self.dispatcher.fire(Event::new(EventKind::Close, Some(id)));
            self.remove(id);
        }
        // Already UNKNOWN (or unknown tube entirely): a no-op, matching the
        // idempotent double-close contract.
    }
}

async fn recv_on(
    datagram: &Option<AsyncDatagram<SocketRef>>,
    buf: &mut [u8],
) -> Result<(usize, SocketAddr, Pktinfo)> {
    match datagram {
        Some(datagram) => datagram.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// A responder creating a tube off an inbound OPEN must record the
    /// captured destination-address pktinfo onto the tube so later replies
    /// reuse the same local interface (`set_local` in `on_open`).
    #[tokio::test]
    async fn responder_creation_captures_pktinfo_onto_tube() {
        let mut responder =
            TubeManager::new(ManagerConfig::new().responder(true).bind_v6(false).port(0)).unwrap();

        let id = id::new_id().unwrap();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let pktinfo = Pktinfo::V4 {
            local_addr: Ipv4Addr::new(127, 0, 0, 1),
            if_index: 1,
        };

        let header = Header::new(id, Command::Open);
        responder.dispatch(header, None, peer, pktinfo);

        let tube = responder.get(id).expect("responder should have created a tube");
        assert_eq!(tube.state(), TubeState::Running);
        assert_eq!(tube.local_pktinfo(), pktinfo);
    }

    /// A DATA packet on a RUNNING tube must deliver its decoded CBOR payload
    /// to `data` callbacks, not just the tube id.
    #[tokio::test]
    async fn data_event_carries_the_decoded_payload() {
        let mut responder =
            TubeManager::new(ManagerConfig::new().responder(true).bind_v6(false).port(0)).unwrap();

        let id = id::new_id().unwrap();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        responder.dispatch(Header::new(id, Command::Open), None, peer, Pktinfo::Empty);

        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let captured = std::sync::Arc::clone(&seen);
        responder
            .bind_event(
                "data",
                Box::new(move |event: &Event| {
                    *captured.lock().unwrap() = event.payload.clone();
                }),
            )
            .unwrap();

        let value = Value::text("hello");
        responder.dispatch(Header::new(id, Command::Data), Some(value.clone()), peer, Pktinfo::Empty);

        assert_eq!(*seen.lock().unwrap(), Some(value));
    }

    /// A second OPEN for an identifier the responder already has a RUNNING
    /// tube for must be a no-op: no second "running" fire, no re-sent ACK.
    #[tokio::test]
    async fn duplicate_open_on_running_tube_is_a_no_op() {
        let mut responder =
            TubeManager::new(ManagerConfig::new().responder(true).bind_v6(false).port(0)).unwrap();

        let running_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = std::sync::Arc::clone(&running_count);
        responder
            .bind_event(
                "running",
                Box::new(move |_| {
                    counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            )
            .unwrap();

        let id = id::new_id().unwrap();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        responder.dispatch(Header::new(id, Command::Open), None, peer, Pktinfo::Empty);
        assert_eq!(responder.get(id).map(|t| t.state()), Some(TubeState::Running));
        assert_eq!(running_count.load(std::sync::atomic::Ordering::SeqCst), 1);

        responder.dispatch(Header::new(id, Command::Open), None, peer, Pktinfo::Empty);
        assert_eq!(responder.len(), 1);
        assert_eq!(running_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// A signal registered via `watch_signal` must have its callback
    /// invoked from the loop thread once the loop observes the wake, not
    /// merely logged.
    #[tokio::test]
    async fn watch_signal_runs_callback_from_loop_thread() {
        let mut manager = TubeManager::new(ManagerConfig::new().bind_v6(false).port(0)).unwrap();

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&fired);
        let _sig_id = manager
            .handle()
            .watch_signal(libc::SIGUSR2, move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .unwrap();

        // SAFETY: raising a signal this process already registered a
        // handler for; the handler only writes one byte to the self-pipe.
        unsafe {
            libc::raise(libc::SIGUSR2);
        }

        tokio::time::timeout(Duration::from_millis(200), manager.run())
            .await
            .ok();

        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn responder_handshake_completes_and_fires_running() {
        let mut responder = TubeManager::new(
            ManagerConfig::new()
                .responder(true)
                .bind_v6(false)
                .port(0),
        )
        .unwrap();
        let mut initiator = TubeManager::new(ManagerConfig::new().bind_v6(false).port(0)).unwrap();

        let responder_port = responder.local_v4_port().unwrap();
        let responder_addr: SocketAddr = format!("127.0.0.1:{responder_port}").parse().unwrap();

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&ran);
        responder
            .bind_event(
                "running",
                Box::new(move |_| {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                }),
            )
            .unwrap();

        let tube_id = initiator.open_tube(responder_addr).unwrap();

        let responder_task = tokio::spawn(async move {
            tokio::time::timeout(Duration::from_millis(200), responder.run())
                .await
                .ok();
            ran
        });

        // Give the initiator's OPEN a moment to land, then let the
        // initiator process the ACK.
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_millis(200), initiator.run())
            .await
            .ok();

        let ran = responder_task.await.unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(initiator.get(tube_id).map(|t| t.state()), Some(TubeState::Running));
    }
}
