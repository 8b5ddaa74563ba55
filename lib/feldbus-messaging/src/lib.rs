//! Peer-to-peer messaging layer above some byte-oriented physical link
//! (Bluetooth, a serial port, ...): STX/ETX-framed, base64-encoded packets
//! carrying either RPC calls or pushes into a data sink.
//!
//! Two threads do all the work: a "main" thread drains the outbound queue
//! and calls [`LinkTransport::write`], gated on each peer being enabled and
//! connected; a "worker" thread drains the inbound queue and invokes RPC
//! callbacks or data-sink notification handlers. Public methods just
//! enqueue and return — the caller is never blocked on the link.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const STX: u8 = 2;
const ETX: u8 = 3;
const RPC_ID_LIMIT: u8 = 64;
const MAX_SINK_BUFFER: usize = 93;
const IN_BUFFER_CAPACITY: usize = 128;

/// Physical-link hook an application provides; everything above this is
/// link-agnostic.
pub trait LinkTransport: Send + Sync {
    /// Writes a fully framed packet to `peer_id`. Only called for enabled
    /// peers; never required to block indefinitely.
    fn write(&self, peer_id: u8, data: &[u8]) -> bool;
    /// Physical connection status, independent of whether the peer is enabled.
    fn connection_status(&self, peer_id: u8) -> Status;
    /// Called when a peer is enabled or disabled, so the link can
    /// start/stop trying to physically connect.
    fn set_peer_enabled_lowlevel(&self, peer_id: u8, enabled: bool);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
}

impl Status {
    fn as_u8(self) -> u8 {
        match self {
            Status::Disconnected => 0,
            Status::Connecting => 1,
            Status::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Status {
        match value {
            2 => Status::Connected,
            1 => Status::Connecting,
            _ => Status::Disconnected,
        }
    }
}

struct PeerState {
    enabled: AtomicBool,
    connected_once: AtomicBool,
    last_status: AtomicU8,
}

impl Default for PeerState {
    fn default() -> Self {
        PeerState {
            enabled: AtomicBool::new(false),
            connected_once: AtomicBool::new(false),
            last_status: AtomicU8::new(Status::Disconnected.as_u8()),
        }
    }
}

struct DataSinkEntry {
    buffer: Vec<u8>,
    has_notification_handler: bool,
}

struct DataProviderEntry {
    destination: u8,
    id: u8,
    buffer: Vec<u8>,
}

enum OutboundItem {
    Rpc { peer_id: u8, rpc_id: u8, param: u64 },
    Data { peer_id: u8, provider_id: u8 },
}

impl OutboundItem {
    fn peer_id(&self) -> u8 {
        match self {
            OutboundItem::Rpc { peer_id, .. } => *peer_id,
            OutboundItem::Data { peer_id, .. } => *peer_id,
        }
    }
}

enum InboundItem {
    Rpc { peer_id: u8, rpc_id: u8, param: u64 },
    DataSink { peer_id: u8, sink_id: u8 },
}

struct InBuffer {
    data: [u8; IN_BUFFER_CAPACITY],
    index: usize,
    wait_for_start_byte: bool,
}

impl InBuffer {
    fn new() -> Self {
        InBuffer { data: [0; IN_BUFFER_CAPACITY], index: 0, wait_for_start_byte: false }
    }
}

/// Reserve this many outbound-queue slots so a data-provider flood can never
/// starve RPC calls out entirely.
const OUTQUEUE_RPC_RESERVED_SLOTS: usize = 4;

struct Shared<T: LinkTransport> {
    transport: T,
    peers: Vec<PeerState>,
    rpc_functions: Mutex<Vec<Option<Box<dyn Fn(u8, u64) + Send + Sync>>>>,
    data_sinks: Mutex<Vec<Option<DataSinkEntry>>>,
    notification_handlers: Mutex<std::collections::HashMap<u8, NotificationHandler>>,
    data_providers: Mutex<Vec<DataProviderEntry>>,
    in_buffers: Mutex<Vec<InBuffer>>,
    out_queue: Mutex<VecDeque<OutboundItem>>,
    out_queue_capacity: usize,
    out_cond: Condvar,
    in_queue: Mutex<VecDeque<InboundItem>>,
    in_cond: Condvar,
    shutdown: AtomicBool,
}

/// Data-sink notification callback, invoked on the worker thread whenever
/// new data lands in the sink. Argument is the sink's own id.
pub type NotificationHandler = Box<dyn Fn(u8) + Send + Sync>;

/// Owns the shared state and the two worker threads. Dropping the handle
/// (or calling [`Messaging::shutdown`]) stops both threads.
pub struct Messaging<T: LinkTransport + 'static> {
    shared: Arc<Shared<T>>,
    main_handle: Option<std::thread::JoinHandle<()>>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

impl<T: LinkTransport + 'static> Messaging<T> {
    /// `num_peers`/`num_rpcs`/`num_sinks` mirror the compile-time limits of
    /// the original module (at most 256 peers, 64 RPCs, 64 data sinks);
    /// here they're runtime capacities so the link can size them to what it
    /// actually needs.
    pub fn new(transport: T, num_peers: usize, num_rpcs: usize, num_sinks: usize, out_queue_capacity: usize) -> Self {
        let mut peers = Vec::with_capacity(num_peers);
        peers.resize_with(num_peers, PeerState::default);
        let mut in_buffers = Vec::with_capacity(num_peers);
        in_buffers.resize_with(num_peers, InBuffer::new);

        let shared = Arc::new(Shared {
            transport,
            peers,
            rpc_functions: Mutex::new((0..num_rpcs).map(|_| None).collect()),
            data_sinks: Mutex::new((0..num_sinks).map(|_| None).collect()),
            notification_handlers: Mutex::new(std::collections::HashMap::new()),
            data_providers: Mutex::new(Vec::new()),
            in_buffers: Mutex::new(in_buffers),
            out_queue: Mutex::new(VecDeque::new()),
            out_queue_capacity,
            out_cond: Condvar::new(),
            in_queue: Mutex::new(VecDeque::new()),
            in_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let main_shared = shared.clone();
        let main_handle = std::thread::Builder::new()
            .name("messaging-main".into())
            .spawn(move || main_thread_func(main_shared))
            .expect("spawn messaging main thread");

        let worker_shared = shared.clone();
        let worker_handle = std::thread::Builder::new()
            .name("messaging-worker".into())
            .spawn(move || worker_thread_func(worker_shared))
            .expect("spawn messaging worker thread");

        Messaging { shared, main_handle: Some(main_handle), worker_handle: Some(worker_handle) }
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.out_cond.notify_all();
        self.shared.in_cond.notify_all();
        if let Some(h) = self.main_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.worker_handle.take() {
            let _ = h.join();
        }
    }

    pub fn register_rpc_function(&self, rpc_id: u8, callback: impl Fn(u8, u64) + Send + Sync + 'static) -> bool {
        let mut functions = self.shared.rpc_functions.lock().unwrap();
        match functions.get_mut(rpc_id as usize) {
            Some(slot) => {
                *slot = Some(Box::new(callback));
                true
            }
            None => {
                log::error!("invalid RPC ID {}", rpc_id);
                false
            }
        }
    }

    /// Enqueues an RPC call; returns once it's queued, not once it's sent.
    pub fn call_rpc(&self, destination: u8, rpc_id: u8, param: u64) -> bool {
        let Some(peer) = self.shared.peers.get(destination as usize) else {
            log::error!("invalid peer ID {}", destination);
            return false;
        };
        if !peer.enabled.load(Ordering::Relaxed) {
            log::warn!("peer {} not enabled", destination);
            return false;
        }
        let mut queue = self.shared.out_queue.lock().unwrap();
        if queue.len() >= self.shared.out_queue_capacity {
            log::error!("couldn't call RPC {} on peer {}; outQueue full", rpc_id, destination);
            return false;
        }
        queue.push_back(OutboundItem::Rpc { peer_id: destination, rpc_id, param });
        drop(queue);
        self.shared.out_cond.notify_one();
        true
    }

    pub fn add_data_sink(&self, sink_id: u8, buffer_size: usize, notification_handler: Option<NotificationHandler>) -> bool {
        if buffer_size > MAX_SINK_BUFFER {
            log::error!("data sinks cannot hold data bigger than {} bytes", MAX_SINK_BUFFER);
            return false;
        }
        let mut sinks = self.shared.data_sinks.lock().unwrap();
        let Some(slot) = sinks.get_mut(sink_id as usize) else {
            log::error!("invalid data sink ID or storage pointer zero");
            return false;
        };
        if slot.is_some() {
            log::warn!("data sink {} was overwritten", sink_id);
        }
        *slot = Some(DataSinkEntry { buffer: vec![0; buffer_size], has_notification_handler: notification_handler.is_some() });
        drop(sinks);
        if let Some(handler) = notification_handler {
            self.shared.notification_handlers.lock().unwrap().insert(sink_id, handler);
        }
        true
    }

    pub fn get_data(&self, sink_id: u8) -> Option<Vec<u8>> {
        let sinks = self.shared.data_sinks.lock().unwrap();
        let entry = sinks.get(sink_id as usize)?.as_ref()?;
        Some(entry.buffer.clone())
    }

    pub fn add_data_provider(&self, destination: u8, provider_id: u8, buffer_size: usize) -> bool {
        if buffer_size > MAX_SINK_BUFFER {
            log::error!("data provider cannot hold data bigger than {} bytes", MAX_SINK_BUFFER);
            return false;
        }
        let mut providers = self.shared.data_providers.lock().unwrap();
        if let Some(existing) = providers.iter_mut().find(|p| p.destination == destination && p.id == provider_id) {
            log::warn!("data provider {} was overwritten", provider_id);
            existing.buffer = vec![0; buffer_size];
        } else {
            providers.push(DataProviderEntry { destination, id: provider_id, buffer: vec![0; buffer_size] });
        }
        true
    }

    /// Copies `data` into the provider's buffer and enqueues a push.
    pub fn push_data(&self, destination: u8, provider_id: u8, data: &[u8]) -> bool {
        let mut providers = self.shared.data_providers.lock().unwrap();
        let Some(provider) = providers.iter_mut().find(|p| p.destination == destination && p.id == provider_id) else {
            log::error!("specified data provider couldn't be found");
            return false;
        };
        if data.len() != provider.buffer.len() {
            log::error!("incorrect data length (pushData dest={} id={})", destination, provider_id);
            return false;
        }
        provider.buffer.copy_from_slice(data);
        drop(providers);
        self.enqueue_push(destination, provider_id)
    }

    /// Re-enqueues a push of whatever is currently in the provider's buffer.
    pub fn push_data_unchanged(&self, destination: u8, provider_id: u8) -> bool {
        self.enqueue_push(destination, provider_id)
    }

    fn enqueue_push(&self, destination: u8, provider_id: u8) -> bool {
        let Some(peer) = self.shared.peers.get(destination as usize) else { return false };
        if !peer.enabled.load(Ordering::Relaxed) {
            return false;
        }
        let mut queue = self.shared.out_queue.lock().unwrap();
        // Data pushes leave headroom for RPC calls so a flood of pushes
        // can't starve time-sensitive RPCs out of the queue entirely.
        if queue.len() + OUTQUEUE_RPC_RESERVED_SLOTS >= self.shared.out_queue_capacity {
            log::error!("couldn't push data to provider {}, outQueue full", provider_id);
            return false;
        }
        queue.push_back(OutboundItem::Data { peer_id: destination, provider_id });
        drop(queue);
        self.shared.out_cond.notify_one();
        true
    }

    pub fn connection_status(&self, peer_id: u8) -> Status {
        match self.shared.peers.get(peer_id as usize) {
            Some(peer) if peer.enabled.load(Ordering::Relaxed) => self.shared.transport.connection_status(peer_id),
            _ => Status::Disconnected,
        }
    }

    pub fn connection_was_successful_once(&self, peer_id: u8) -> bool {
        self.shared.peers.get(peer_id as usize).is_some_and(|p| p.connected_once.load(Ordering::Relaxed))
    }

    pub fn set_peer_enabled(&self, peer_id: u8, enabled: bool) {
        let Some(peer) = self.shared.peers.get(peer_id as usize) else { return };
        peer.enabled.store(enabled, Ordering::Relaxed);
        self.shared.transport.set_peer_enabled_lowlevel(peer_id, enabled);
        if !enabled {
            log::info!("peer {} disabled", peer_id);
        } else if self.connection_status(peer_id) != Status::Connected {
            log::info!("peer {} enabled, waiting for successful connection", peer_id);
        }
    }

    /// Feeds raw bytes received from the link for `sender` through the
    /// STX/ETX framer. Call this from whatever reads the physical link.
    pub fn parse_incoming(&self, sender: u8, bytes: &[u8]) {
        let Some(peer) = self.shared.peers.get(sender as usize) else { return };
        let mut in_buffers = self.shared.in_buffers.lock().unwrap();
        let Some(in_buffer) = in_buffers.get_mut(sender as usize) else { return };

        if !peer.enabled.load(Ordering::Relaxed) {
            in_buffer.wait_for_start_byte = true;
            return;
        }

        for &byte in bytes {
            if byte == STX {
                in_buffer.index = 0;
                in_buffer.wait_for_start_byte = false;
            } else if in_buffer.wait_for_start_byte {
                continue;
            } else if byte == ETX {
                let frame = &in_buffer.data[..in_buffer.index];
                if let Ok(decoded) = BASE64.decode(frame) {
                    self.dispatch_decoded(sender, &decoded);
                }
            } else if in_buffer.index < IN_BUFFER_CAPACITY {
                in_buffer.data[in_buffer.index] = byte;
                in_buffer.index += 1;
                if in_buffer.index == IN_BUFFER_CAPACITY {
                    in_buffer.wait_for_start_byte = true;
                    log::warn!("overflow in recv buffer for peer {}", sender);
                }
            }
        }
    }

    fn dispatch_decoded(&self, sender: u8, decoded: &[u8]) {
        if decoded.is_empty() {
            return;
        }
        if decoded[0] < RPC_ID_LIMIT {
            let rpc_id = decoded[0];
            let rpc_count = self.shared.rpc_functions.lock().unwrap().len();
            if rpc_id as usize >= rpc_count {
                log::error!("RPC {} recv from {} -> ID invalid", rpc_id, sender);
                return;
            }
            if decoded.len() != 9 {
                log::error!("RPC {} recv from {} -> package size mismatch ({})", rpc_id, sender, decoded.len());
                return;
            }
            let param = u64::from_le_bytes(decoded[1..9].try_into().unwrap());
            let mut queue = self.shared.in_queue.lock().unwrap();
            queue.push_back(InboundItem::Rpc { peer_id: sender, rpc_id, param });
            drop(queue);
            self.shared.in_cond.notify_one();
        } else {
            let sink_id = decoded[0] - RPC_ID_LIMIT;
            let mut sinks = self.shared.data_sinks.lock().unwrap();
            let Some(Some(entry)) = sinks.get_mut(sink_id as usize) else {
                log::error!("DataSink {} recv data from {} -> ID invalid!", sink_id, sender);
                return;
            };
            if decoded.len() != entry.buffer.len() {
                log::warn!("received data for data sink {} but buffer size doesn't match", sink_id);
                return;
            }
            entry.buffer.copy_from_slice(decoded);
            let has_handler = entry.has_notification_handler;
            drop(sinks);
            if has_handler {
                let mut queue = self.shared.in_queue.lock().unwrap();
                queue.push_back(InboundItem::DataSink { peer_id: sender, sink_id });
                drop(queue);
                self.shared.in_cond.notify_one();
            }
        }
    }
}

/// Detects and logs connection-status edges per peer, and latches
/// `connected_once` on the first disconnected/connecting -> connected
/// transition. `connected_once` stays set across later drops, so a caller
/// can tell "was ever connected" apart from "connected right now".
fn poll_connection_edges<T: LinkTransport>(shared: &Arc<Shared<T>>) {
    for (peer_id, peer) in shared.peers.iter().enumerate() {
        if !peer.enabled.load(Ordering::Relaxed) {
            continue;
        }
        let current = shared.transport.connection_status(peer_id as u8);
        let previous = Status::from_u8(peer.last_status.swap(current.as_u8(), Ordering::Relaxed));
        if current == previous {
            continue;
        }
        log::info!("peer {peer_id}: {previous:?} -> {current:?}");
        if current == Status::Connected {
            peer.connected_once.store(true, Ordering::Relaxed);
        }
    }
}

fn main_thread_func<T: LinkTransport>(shared: Arc<Shared<T>>) {
    log::info!("messaging main thread started");
    while !shared.shutdown.load(Ordering::SeqCst) {
        poll_connection_edges(&shared);

        let item = {
            let mut queue = shared.out_queue.lock().unwrap();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(item) = queue.front() {
                    break Some(item.peer_id());
                }
                let (guard, timeout) = shared.out_cond.wait_timeout(queue, Duration::from_millis(50)).unwrap();
                queue = guard;
                if timeout.timed_out() && queue.is_empty() {
                    break None;
                }
            }
        };

        let Some(peer_id) = item else { continue };
        let Some(peer) = shared.peers.get(peer_id as usize) else {
            shared.out_queue.lock().unwrap().pop_front();
            continue;
        };
        if !peer.enabled.load(Ordering::Relaxed) {
            shared.out_queue.lock().unwrap().pop_front();
            continue;
        }
        if shared.transport.connection_status(peer_id) != Status::Connected {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }

        // Only remove the item once it was actually written; on failure it
        // stays at the front of the queue and is retried next time around.
        let sent = match shared.out_queue.lock().unwrap().front() {
            Some(entry) => send_one(&shared, entry),
            None => continue,
        };
        if sent {
            shared.out_queue.lock().unwrap().pop_front();
        }
    }
}

fn send_one<T: LinkTransport>(shared: &Arc<Shared<T>>, item: &OutboundItem) -> bool {
    match *item {
        OutboundItem::Rpc { peer_id, rpc_id, param } => {
            let mut payload = Vec::with_capacity(9);
            payload.push(rpc_id);
            payload.extend_from_slice(&param.to_le_bytes());
            let framed = frame(&payload);
            let ok = shared.transport.write(peer_id, &framed);
            if ok {
                log::debug!("call remote RPC {} on peer {}", rpc_id, peer_id);
            } else {
                log::warn!("call remote RPC {} on peer {} - FAILED", rpc_id, peer_id);
            }
            ok
        }
        OutboundItem::Data { peer_id, provider_id } => {
            let mut providers = shared.data_providers.lock().unwrap();
            let Some(provider) = providers.iter_mut().find(|p| p.destination == peer_id && p.id == provider_id) else {
                return true;
            };
            provider.buffer[0] = provider.id + RPC_ID_LIMIT;
            let framed = frame(&provider.buffer);
            drop(providers);
            let ok = shared.transport.write(peer_id, &framed);
            if ok {
                log::debug!("DataProvider {} push to {}", provider_id, peer_id);
            } else {
                log::warn!("DataProvider {} push to {} - FAILED", provider_id, peer_id);
            }
            ok
        }
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() * 4 / 3 + 4 + 2);
    framed.push(STX);
    framed.extend(BASE64.encode(payload).into_bytes());
    framed.push(ETX);
    framed
}

fn worker_thread_func<T: LinkTransport>(shared: Arc<Shared<T>>) {
    log::info!("messaging worker thread started");
    loop {
        let item = {
            let mut queue = shared.in_queue.lock().unwrap();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break Some(item);
                }
                let (guard, timeout) = shared.in_cond.wait_timeout(queue, Duration::from_millis(200)).unwrap();
                queue = guard;
                if timeout.timed_out() && queue.is_empty() {
                    break None;
                }
            }
        };
        let Some(item) = item else { continue };

        match item {
            InboundItem::Rpc { peer_id, rpc_id, param } => {
                let functions = shared.rpc_functions.lock().unwrap();
                if let Some(Some(callback)) = functions.get(rpc_id as usize) {
                    log::debug!("call RPC {}", rpc_id);
                    callback(peer_id, param);
                }
            }
            InboundItem::DataSink { peer_id: _, sink_id } => {
                let handlers = shared.notification_handlers.lock().unwrap();
                if let Some(handler) = handlers.get(&sink_id) {
                    log::debug!("call data sink notifier {}", sink_id);
                    handler(sink_id);
                }
            }
        }
    }
}

impl<T: LinkTransport> Drop for Messaging<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    struct LoopbackLink {
        connected: AtomicBool,
        sent: Arc<StdMutex<Vec<(u8, Vec<u8>)>>>,
    }

    impl LoopbackLink {
        fn new() -> (Self, Arc<StdMutex<Vec<(u8, Vec<u8>)>>>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            (LoopbackLink { connected: AtomicBool::new(true), sent: sent.clone() }, sent)
        }
    }

    impl LinkTransport for LoopbackLink {
        fn write(&self, peer_id: u8, data: &[u8]) -> bool {
            self.sent.lock().unwrap().push((peer_id, data.to_vec()));
            true
        }
        fn connection_status(&self, _peer_id: u8) -> Status {
            if self.connected.load(Ordering::Relaxed) { Status::Connected } else { Status::Disconnected }
        }
        fn set_peer_enabled_lowlevel(&self, _peer_id: u8, _enabled: bool) {}
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn call_rpc_is_framed_and_written_to_the_link() {
        let (link, sent) = LoopbackLink::new();
        let messaging = Messaging::new(link, 4, 8, 8, 16);
        messaging.set_peer_enabled(0, true);

        assert!(messaging.call_rpc(0, 3, 0xAABBCCDD));
        assert!(wait_until(|| !sent.lock().unwrap().is_empty()));

        let (peer, framed) = sent.lock().unwrap()[0].clone();
        assert_eq!(peer, 0);
        assert_eq!(framed[0], STX);
        assert_eq!(*framed.last().unwrap(), ETX);

        let decoded = BASE64.decode(&framed[1..framed.len() - 1]).unwrap();
        assert_eq!(decoded[0], 3);
        assert_eq!(u64::from_le_bytes(decoded[1..9].try_into().unwrap()), 0xAABBCCDD);
    }

    #[test]
    fn call_rpc_to_disabled_peer_fails_immediately() {
        let (link, _sent) = LoopbackLink::new();
        let messaging = Messaging::new(link, 4, 8, 8, 16);
        assert!(!messaging.call_rpc(0, 0, 0));
    }

    #[test]
    fn rpc_round_trips_through_parse_incoming_to_callback() {
        let (link, _sent) = LoopbackLink::new();
        let messaging = Messaging::new(link, 4, 8, 8, 16);
        messaging.set_peer_enabled(1, true);

        let received = Arc::new(AtomicU64::new(0));
        let received_clone = received.clone();
        messaging.register_rpc_function(5, move |_sender, param| {
            received_clone.store(param, Ordering::SeqCst);
        });

        let mut payload = vec![5u8];
        payload.extend_from_slice(&42u64.to_le_bytes());
        let mut framed = vec![STX];
        framed.extend(BASE64.encode(&payload).into_bytes());
        framed.push(ETX);

        messaging.parse_incoming(1, &framed);
        assert!(wait_until(|| received.load(Ordering::SeqCst) == 42));
    }

    #[test]
    fn data_sink_receives_pushed_bytes_and_fires_notification() {
        let (link, _sent) = LoopbackLink::new();
        let messaging = Messaging::new(link, 4, 8, 8, 16);
        messaging.set_peer_enabled(1, true);

        let notified = Arc::new(AtomicBool::new(false));
        let notified_clone = notified.clone();
        assert!(messaging.add_data_sink(2, 3, Some(Box::new(move |_id| notified_clone.store(true, Ordering::SeqCst)))));

        let payload = [2u8 + RPC_ID_LIMIT, 0x11, 0x22];
        let mut framed = vec![STX];
        framed.extend(BASE64.encode(payload).into_bytes());
        framed.push(ETX);

        messaging.parse_incoming(1, &framed);
        assert!(wait_until(|| notified.load(Ordering::SeqCst)));
        assert_eq!(messaging.get_data(2).unwrap(), vec![2 + RPC_ID_LIMIT, 0x11, 0x22]);
    }

    #[test]
    fn push_data_requires_matching_provider_and_length() {
        let (link, _sent) = LoopbackLink::new();
        let messaging = Messaging::new(link, 4, 8, 8, 16);
        messaging.set_peer_enabled(0, true);
        assert!(messaging.add_data_provider(0, 7, 4));

        assert!(!messaging.push_data(0, 7, &[1, 2]));
        assert!(messaging.push_data(0, 7, &[0, 1, 2, 3]));
    }

    #[test]
    fn connection_was_successful_once_stays_true_after_a_drop() {
        let (link, _sent) = LoopbackLink::new();
        link.connected.store(false, Ordering::Relaxed);
        let messaging = Messaging::new(link, 4, 8, 8, 16);
        messaging.set_peer_enabled(0, true);

        assert!(!messaging.connection_was_successful_once(0));

        messaging.shared.transport.connected.store(true, Ordering::Relaxed);
        assert!(wait_until(|| messaging.connection_was_successful_once(0)));

        messaging.shared.transport.connected.store(false, Ordering::Relaxed);
        assert!(wait_until(|| messaging.connection_status(0) == Status::Disconnected));
        assert!(messaging.connection_was_successful_once(0));
    }
}
