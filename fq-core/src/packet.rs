use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc,
};

use bytes::Bytes;

/// Priority classes occupy the low 4 bits of a packet's priority word.
pub const PRIO_MAX: u32 = 15;
/// Packets in the control class bypass fair queueing and pacing entirely.
pub const PRIO_CONTROL: u32 = 7;

/// Connection state of an [`Endpoint`], as far as the scheduler cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    Established = 0,
    /// Listening sockets emit handshake replies that are not part of a flow
    /// yet and must not inherit the listener's pacing rate.
    Listener = 1,
    /// Non-connected endpoints (e.g. unconnected UDP senders) reach many
    /// destinations from one socket; their packets are keyed by header hash.
    Closed = 2,
}

/// Host socket surrogate owning one or more flows.
///
/// Fields the host may retune while packets are in flight are atomics, so no
/// lock is needed around the scheduler.
#[derive(Debug)]
pub struct Endpoint {
    id: u64,
    hash: AtomicU32,
    pacing_rate: AtomicU64,
    state: AtomicU8,
}

impl Endpoint {
    pub fn new(id: u64, hash: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            hash: AtomicU32::new(hash),
            pacing_rate: AtomicU64::new(u64::MAX),
            state: AtomicU8::new(EndpointState::Established as u8),
        })
    }

    /// Stable identity; two sockets never share an id while both are alive.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hash(&self) -> u32 {
        self.hash.load(Ordering::Relaxed)
    }

    /// Called by the host when the socket is reused for a new connection.
    /// The scheduler detects the change and resets the flow's credit.
    pub fn set_hash(&self, hash: u32) {
        self.hash.store(hash, Ordering::Relaxed);
    }

    /// Pacing rate in bytes per second, `u64::MAX` when unpaced.
    pub fn pacing_rate(&self) -> u64 {
        self.pacing_rate.load(Ordering::Relaxed)
    }

    pub fn set_pacing_rate(&self, rate: u64) {
        self.pacing_rate.store(rate, Ordering::Relaxed);
    }

    pub fn state(&self) -> EndpointState {
        match self.state.load(Ordering::Relaxed) {
            1 => EndpointState::Listener,
            2 => EndpointState::Closed,
            _ => EndpointState::Established,
        }
    }

    pub fn set_state(&self, state: EndpointState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Identity of a flow: an owning endpoint, or a synthetic key for packets
/// without one. Synthetic raw values are odd and endpoint raw values even,
/// so the two key spaces cannot collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKey {
    Endpoint(u64),
    Synthetic(u32),
}

impl FlowKey {
    /// Raw value used for bucket hashing and in-bucket ordering.
    pub(crate) fn raw(self) -> u64 {
        match self {
            FlowKey::Endpoint(id) => id << 1,
            FlowKey::Synthetic(hash) => ((hash as u64) << 1) | 1,
        }
    }
}

/// A packet handed to the scheduler for transmission.
///
/// The payload is opaque: the scheduler reads the metadata, stamps
/// `time_to_send` on admission and `ce_marked` on late departure, and hands
/// the packet back on dequeue.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Bytes,
    /// Requested departure time in ns, 0 meaning "as soon as possible".
    tstamp: u64,
    priority: u32,
    /// Hash of the header 4-tuple.
    hash: u32,
    src_port: u16,
    dst_port: u16,
    endpoint: Option<Arc<Endpoint>>,
    /// Effective departure time, assigned at enqueue.
    pub(crate) time_to_send: u64,
    ce_marked: bool,
}

impl Packet {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            tstamp: 0,
            priority: 0,
            hash: 0,
            src_port: 0,
            dst_port: 0,
            endpoint: None,
            time_to_send: 0,
            ce_marked: false,
        }
    }

    pub fn with_tstamp(mut self, tstamp: u64) -> Self {
        self.tstamp = tstamp;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_hash(mut self, hash: u32) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_ports(mut self, src: u16, dst: u16) -> Self {
        self.src_port = src;
        self.dst_port = dst;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Arc<Endpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Wire length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[inline]
    pub fn tstamp(&self) -> u64 {
        self.tstamp
    }

    pub(crate) fn cap_tstamp(&mut self, tstamp: u64) {
        self.tstamp = tstamp;
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    #[inline]
    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.endpoint.as_ref()
    }

    /// Departure time assigned by the scheduler, ns.
    #[inline]
    pub fn time_to_send(&self) -> u64 {
        self.time_to_send
    }

    /// Congestion-experienced mark, set when the packet left later than the
    /// configured threshold.
    #[inline]
    pub fn ce_marked(&self) -> bool {
        self.ce_marked
    }

    pub(crate) fn mark_ce(&mut self) {
        self.ce_marked = true;
    }

    pub(crate) fn is_control(&self) -> bool {
        self.priority & PRIO_MAX == PRIO_CONTROL
    }

    /// Detaches the packet from its owning endpoint.
    pub(crate) fn orphan(&mut self) {
        self.endpoint = None;
    }
}
