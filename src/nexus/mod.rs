mod bg;
mod event;

use std::cell::Cell;
use std::io::ErrorKind as IoErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::{thread, time};

use ahash::RandomState;
use dashmap::DashMap;
use quanta::Clock;
use rmp_serde as rmps;

pub(crate) use self::bg::*;
pub(crate) use self::event::SmHook;
pub use self::event::{SmErr, SmEventKind, SmHandler};
pub(crate) use self::event::{SmPkt, SmPktKind};
use crate::handler::{ReqFunc, ReqFuncKind, ReqHandle};
use crate::rpc::Rpc;
use crate::transport::{UdpTransport, UnreliableTransport};
use crate::type_alias::*;
use crate::util::mt_queue::MtQueue;

/// Number of request types, i.e., the size of the handler table.
pub(crate) const REQ_TYPE_ARRAY_SIZE: usize = ReqType::MAX as usize + 1;

thread_local! {
    static ETID: Cell<Option<ETid>> = const { Cell::new(None) };
}

/// Endpoint thread IDs are unique across the whole process, so a thread
/// keeps one identity even when multiple Nexus instances coexist.
static NEXT_ETID: AtomicUsize = AtomicUsize::new(0);

/// Process-wide registry assigning each participating thread a small
/// endpoint thread ID. Dispatch threads and background threads register;
/// `Rpc` uses the IDs to decide whether a caller is its dispatch thread.
pub(crate) struct TlsRegistry;

impl TlsRegistry {
    fn new() -> Self {
        Self
    }

    /// Assign the calling thread an endpoint thread ID if it has none.
    pub fn init(&self) -> ETid {
        ETID.with(|etid| match etid.get() {
            Some(id) => id,
            None => {
                let id = NEXT_ETID.fetch_add(1, Ordering::Relaxed);
                etid.set(Some(id));
                id
            }
        })
    }

    /// The calling thread's endpoint thread ID, if registered.
    #[inline]
    pub fn etid(&self) -> Option<ETid> {
        ETID.with(|etid| etid.get())
    }
}

/// Session-management part of a [`Nexus`].
struct NexusSm {
    uri: SocketAddr,
    hooks: DashMap<RpcId, Arc<SmHook>, RandomState>,
    should_stop: AtomicBool,
}

impl NexusSm {
    /// Listen on the given socket for SM packets and deposit them into the
    /// destination endpoint's hook.
    fn listen(self: Arc<Self>, socket: UdpSocket) {
        const SM_PKT_SIZE_LIMIT: usize = 4 << 10;
        let mut buf = [0u8; SM_PKT_SIZE_LIMIT];
        while !self.should_stop.load(Ordering::Relaxed) {
            let (amt, src) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e)
                    if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(e) => panic!("failed to receive SM packet: {}", e),
            };
            let Ok(pkt) = rmps::from_slice::<SmPkt>(&buf[..amt]) else {
                // UDP is unreliable; just ignore malformed packets.
                log::debug!("Nexus SM: ignoring malformed packet from {}", src);
                continue;
            };

            let dst = pkt.dst_rpc_id();
            match self.hooks.get(&dst) {
                Some(hook) => hook.push(pkt),
                None => log::debug!("Nexus SM: ignoring packet to non-existent Rpc {}", dst),
            };
        }
    }
}

/// The per-process control object: owns the SM listener, the background
/// worker threads, the request-handler registry, and the thread registry.
/// Endpoints are created against a shared `Nexus`.
pub struct Nexus<Tp: UnreliableTransport = UdpTransport> {
    sm: Arc<NexusSm>,
    sm_thread: Option<thread::JoinHandle<()>>,

    req_funcs: Mutex<Vec<Option<ReqFunc<Tp>>>>,

    tls_registry: Arc<TlsRegistry>,

    bg_queues: Vec<Arc<MtQueue<BgWorkItem<Tp>>>>,
    bg_threads: Vec<thread::JoinHandle<()>>,
    bg_kill_switch: Arc<AtomicBool>,

    /// NUMA node hint for hugepage reservations.
    numa_node: usize,

    /// Shared TSC reader.
    clock: Clock,

    /// TSC frequency in GHz, measured once here.
    freq_ghz: f64,
}

impl<Tp: UnreliableTransport> Nexus<Tp> {
    /// Create a new Nexus listening for session management on `uri`, with
    /// `num_bg_threads` background workers for handlers and continuations
    /// registered as [`ReqFuncKind::Background`].
    ///
    /// # Panics
    ///
    /// Panic if the URI cannot be resolved or bound.
    pub fn new(uri: impl ToSocketAddrs, numa_node: usize, num_bg_threads: usize) -> Arc<Self> {
        let uri = uri.to_socket_addrs().unwrap().next().unwrap();
        let socket = UdpSocket::bind(uri).unwrap();

        const SOCKET_READ_TIMEOUT: time::Duration = time::Duration::from_millis(100);
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT)).unwrap();

        // The TSC frequency is measured once and shared; all datapath
        // timestamps derive from it.
        let clock = Clock::new();
        let start = clock.raw();
        thread::sleep(time::Duration::from_millis(10));
        let end = clock.raw();
        let freq_ghz = (end - start) as f64 / clock.delta(start, end).as_nanos() as f64;

        let sm = Arc::new(NexusSm {
            uri,
            hooks: DashMap::with_capacity_and_hasher(256, RandomState::new()),
            should_stop: AtomicBool::new(false),
        });
        let sm_thread = {
            let sm = sm.clone();
            thread::spawn(move || sm.listen(socket))
        };

        let tls_registry = Arc::new(TlsRegistry::new());
        let bg_kill_switch = Arc::new(AtomicBool::new(false));
        let bg_queues: Vec<_> = (0..num_bg_threads)
            .map(|_| Arc::new(MtQueue::new()))
            .collect();
        let bg_threads = bg_queues
            .iter()
            .enumerate()
            .map(|(i, queue)| {
                let queue = queue.clone();
                let tls_registry = tls_registry.clone();
                let kill_switch = bg_kill_switch.clone();
                thread::spawn(move || bg_thread_func(i, queue, tls_registry, kill_switch))
            })
            .collect();

        Arc::new(Self {
            sm,
            sm_thread: Some(sm_thread),
            req_funcs: Mutex::new((0..REQ_TYPE_ARRAY_SIZE).map(|_| None).collect()),
            tls_registry,
            bg_queues,
            bg_threads,
            bg_kill_switch,
            numa_node,
            clock,
            freq_ghz,
        })
    }

    /// Get the URI that this Nexus is listening on.
    #[inline]
    pub fn uri(&self) -> SocketAddr {
        self.sm.uri
    }

    /// Number of background threads owned by this Nexus.
    #[inline]
    pub fn num_bg_threads(&self) -> usize {
        self.bg_queues.len()
    }

    /// Register the handler for a request type. Must be done before any
    /// `Rpc` that should serve this type is created, since endpoints
    /// snapshot the handler table at construction.
    pub fn set_req_handler<F>(&self, req_type: ReqType, kind: ReqFuncKind, handler: F)
    where
        F: Fn(&Rpc<Tp>, ReqHandle<Tp>) + Send + Sync + 'static,
    {
        assert!(
            kind == ReqFuncKind::Foreground || !self.bg_queues.is_empty(),
            "background handler registered on a Nexus without background threads"
        );
        let mut req_funcs = self.req_funcs.lock().unwrap();
        req_funcs[req_type as usize] = Some(ReqFunc {
            func: Arc::new(handler),
            kind,
        });
    }
}

/// Crate-internal plumbing used by `Rpc`.
impl<Tp: UnreliableTransport> Nexus<Tp> {
    /// Create the SM hook for the given Rpc ID.
    ///
    /// # Panics
    ///
    /// Panic if the Rpc ID is already used.
    pub(crate) fn register_hook(&self, rpc_id: RpcId) -> Arc<SmHook> {
        let hook = Arc::new(SmHook::new());
        assert!(
            self.sm.hooks.insert(rpc_id, hook.clone()).is_none(),
            "Rpc ID {} already used",
            rpc_id
        );
        hook
    }

    /// Destroy the SM hook for the given Rpc ID.
    pub(crate) fn destroy_hook(&self, rpc_id: RpcId) {
        self.sm.hooks.remove(&rpc_id);
    }

    /// Snapshot the request handler table.
    pub(crate) fn req_func_snapshot(&self) -> Box<[Option<ReqFunc<Tp>>]> {
        self.req_funcs.lock().unwrap().clone().into_boxed_slice()
    }

    /// Submit a work item to a background thread.
    pub(crate) fn submit_bg(&self, bg_etid: usize, item: BgWorkItem<Tp>) {
        self.bg_queues[bg_etid].push(item);
    }

    pub(crate) fn tls_registry(&self) -> &Arc<TlsRegistry> {
        &self.tls_registry
    }

    #[inline]
    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    #[inline]
    pub(crate) fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    #[inline]
    pub(crate) fn numa_node(&self) -> usize {
        self.numa_node
    }
}

impl<Tp: UnreliableTransport> Drop for Nexus<Tp> {
    fn drop(&mut self) {
        self.bg_kill_switch.store(true, Ordering::SeqCst);
        for handle in self.bg_threads.drain(..) {
            handle.join().unwrap();
        }

        self.sm.should_stop.store(true, Ordering::SeqCst);
        self.sm_thread.take().unwrap().join().unwrap();
    }
}
