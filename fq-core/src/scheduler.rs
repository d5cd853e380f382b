use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, FqConfig, NSEC_PER_SEC};
use crate::flow::{Flow, FlowArena, FlowId, FlowState, ListId};
use crate::packet::{EndpointState, FlowKey, Packet};
use crate::rr::RrLists;
use crate::stats::{Counters, FqStats};
use crate::table::FlowTable;
use crate::throttle::ThrottleTree;
use crate::watchdog::Watchdog;

/// Why a packet was refused. Refused packets are consumed and counted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("global queue limit reached")]
    TailLimit,
    #[error("per-flow queue limit reached")]
    FlowLimit,
    #[error("packet timestamp beyond horizon")]
    Horizon,
}

/// Outcome of classification: a regular flow, or the unrated internal flow
/// serving control traffic and allocation-failure fallback.
enum FlowTarget {
    Internal,
    Flow(FlowId),
}

/// Nanosecond images of the duration-typed config knobs, refreshed whenever
/// the configuration changes.
struct NsCache {
    horizon: u64,
    ce_threshold: u64,
    timer_slack: u64,
    refill_delay: u64,
}

impl NsCache {
    fn of(cfg: &FqConfig) -> Self {
        Self {
            horizon: cfg.horizon.as_nanos() as u64,
            ce_threshold: cfg.ce_threshold.as_nanos() as u64,
            timer_slack: cfg.timer_slack.as_nanos() as u64,
            refill_delay: cfg.flow_refill_delay.as_nanos() as u64,
        }
    }
}

/// Per-flow fair queueing scheduler with rate pacing.
///
/// Single-threaded: the host serializes `enqueue`, `dequeue`, `change` and
/// `reset` on one instance. Separate instances share nothing.
pub struct FqScheduler<C: Clock = MonotonicClock> {
    cfg: FqConfig,
    ns: NsCache,
    clock: C,
    /// Cached clock reading, refreshed once per enqueue/dequeue batch.
    now_cache: u64,
    arena: FlowArena,
    table: FlowTable,
    lists: RrLists,
    throttle: ThrottleTree,
    /// High-priority bypass flow; not in the table, exempt from per-flow
    /// limits, credit and pacing.
    internal: Flow,
    counters: Counters,
    /// Packets queued across all flows, the internal flow included.
    qlen: u32,
    flows: u32,
    inactive_flows: u32,
    /// Co-flow identifiers learned from source-port matches at enqueue.
    pflowid: [Option<u32>; 2],
    /// Promotions into the co list since the last relief.
    ucounter: u32,
    /// When set, dequeue prefers the co list until `ucounter` drains.
    flipflag: bool,
    /// Arrival counter; orders same-departure-time packets within a flow.
    seq: u64,
    /// Packet pulled ahead by `peek`, handed out by the next `dequeue`.
    peeked: Option<Packet>,
    watchdog: Watchdog,
}

impl FqScheduler<MonotonicClock> {
    pub fn new(cfg: FqConfig) -> Result<Self, ConfigError> {
        Self::with_clock(cfg, MonotonicClock::new())
    }
}

impl<C: Clock> FqScheduler<C> {
    pub fn with_clock(cfg: FqConfig, clock: C) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let now = clock.now_ns();
        Ok(Self {
            ns: NsCache::of(&cfg),
            table: FlowTable::new(cfg.buckets_log),
            internal: Flow::new(FlowKey::Synthetic(0), 0, 0, now),
            cfg,
            clock,
            now_cache: now,
            arena: FlowArena::new(),
            lists: RrLists::new(),
            throttle: ThrottleTree::new(),
            counters: Counters::default(),
            qlen: 0,
            flows: 0,
            inactive_flows: 0,
            pflowid: [None, None],
            ucounter: 0,
            flipflag: false,
            seq: 0,
            peeked: None,
            watchdog: Watchdog::default(),
        })
    }

    /// Packets currently queued, the internal flow included.
    pub fn qlen(&self) -> u32 {
        self.qlen
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Pending watchdog deadline, ns. Set when dequeue found every list
    /// empty while flows sit in the throttle tree.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.watchdog.next_wakeup()
    }

    /// Current configuration.
    pub fn dump(&self) -> FqConfig {
        self.cfg.clone()
    }

    /// Snapshot of the statistics counters.
    pub fn dump_stats(&self) -> FqStats {
        let now = self.clock.now_ns();
        let tnd = self.throttle.next_deadline();
        FqStats {
            gc_flows: self.counters.gc_flows,
            highprio_packets: self.counters.highprio_packets,
            throttled: self.counters.throttled,
            flows_plimit_drops: self.counters.flows_plimit_drops,
            pkts_too_long: self.counters.pkts_too_long,
            allocation_errors: self.counters.allocation_errors,
            tail_drops: self.counters.tail_drops,
            ce_mark: self.counters.ce_mark,
            horizon_drops: self.counters.horizon_drops,
            horizon_caps: self.counters.horizon_caps,
            unthrottle_latency_ns: self.counters.unthrottle_latency_ns,
            time_next_delayed_flow: if tnd == u64::MAX {
                i64::MAX
            } else {
                (tnd + self.ns.timer_slack) as i64 - now as i64
            },
            flows: self.flows,
            inactive_flows: self.inactive_flows,
            throttled_flows: self.throttle.len() as u32,
        }
    }

    /// Admits a packet, classifying it into a flow and queueing it in
    /// departure-time order.
    pub fn enqueue(&mut self, mut packet: Packet) -> Result<(), EnqueueError> {
        if self.qlen >= self.cfg.plimit {
            self.counters.tail_drops += 1;
            trace!("tail limit reached, dropping");
            return Err(EnqueueError::TailLimit);
        }

        if packet.tstamp() == 0 {
            self.now_cache = self.clock.now_ns();
            packet.time_to_send = self.now_cache;
        } else {
            if self.beyond_horizon(&packet) {
                // Refresh the cache and give the packet a second chance
                // before acting on a stale reading.
                self.now_cache = self.clock.now_ns();
                if self.beyond_horizon(&packet) {
                    if self.cfg.horizon_drop {
                        self.counters.horizon_drops += 1;
                        trace!(tstamp = packet.tstamp(), "beyond horizon, dropping");
                        return Err(EnqueueError::Horizon);
                    }
                    self.counters.horizon_caps += 1;
                    packet.cap_tstamp(self.now_cache + self.ns.horizon);
                }
            }
            packet.time_to_send = packet.tstamp();
        }

        let target = self.classify(&mut packet);
        self.seq += 1;
        let seq = self.seq;

        match target {
            FlowTarget::Internal => {
                self.internal.push(packet, seq);
                self.counters.highprio_packets += 1;
                self.qlen += 1;
            }
            FlowTarget::Flow(fid) => {
                if self.arena[fid].qlen >= self.cfg.flow_plimit {
                    self.counters.flows_plimit_drops += 1;
                    trace!("flow limit reached, dropping");
                    return Err(EnqueueError::FlowLimit);
                }

                if let FlowState::Detached { age_ns } = self.arena[fid].state {
                    let list = if self.coflow_match(self.arena[fid].socket_hash) {
                        ListId::Co
                    } else {
                        ListId::New
                    };
                    self.lists.push_tail(list, fid);
                    self.arena[fid].state = FlowState::OnList(list);
                    if self.now_cache > age_ns + self.ns.refill_delay {
                        let flow = &mut self.arena[fid];
                        flow.credit = flow.credit.max(self.cfg.quantum as i64);
                    }
                    self.inactive_flows -= 1;
                }

                self.learn_coflow(&packet, fid);

                self.arena[fid].push(packet, seq);
                self.qlen += 1;
            }
        }
        Ok(())
    }

    /// Next packet to transmit, or `None`. When `None` is returned while
    /// flows are throttled, a watchdog wakeup is left armed.
    pub fn dequeue(&mut self) -> Option<Packet> {
        if let Some(packet) = self.peeked.take() {
            self.qlen -= 1;
            return Some(packet);
        }
        self.dequeue_inner()
    }

    /// Non-destructive look at the packet the next [`dequeue`] will return.
    ///
    /// Internally the packet is pulled out of its flow and stashed, so the
    /// scheduling decision is made here; the stashed packet still counts
    /// against the global queue length.
    pub fn peek(&mut self) -> Option<&Packet> {
        if self.peeked.is_none() {
            self.peeked = self.dequeue_inner();
            if self.peeked.is_some() {
                self.qlen += 1;
            }
        }
        self.peeked.as_ref()
    }

    /// Purges all flows and queued packets. Statistics counters survive,
    /// scheduling state (co-flow ids included) does not.
    pub fn reset(&mut self) {
        self.peeked = None;
        self.internal.purge();
        for fid in self.table.take_all() {
            self.arena.remove(fid);
        }
        self.arena.clear();
        self.lists.clear();
        self.throttle.clear();
        self.qlen = 0;
        self.flows = 0;
        self.inactive_flows = 0;
        self.pflowid = [None, None];
        self.ucounter = 0;
        self.flipflag = false;
        self.watchdog.cancel();
    }

    /// Applies a new configuration, resizing the flow table when the bucket
    /// count changed and trimming the backlog down to the new global limit.
    pub fn change(&mut self, cfg: FqConfig) -> Result<(), ConfigError> {
        cfg.validate()?;
        self.cfg = cfg;
        self.ns = NsCache::of(&self.cfg);

        if self.cfg.buckets_log != self.table.log() {
            let old_log = self.table.log();
            self.now_cache = self.clock.now_ns();
            let dropped = self.table.rehash(&mut self.arena, self.cfg.buckets_log, self.now_cache);
            self.flows -= dropped;
            self.inactive_flows -= dropped;
            self.counters.gc_flows += u64::from(dropped);
            debug!(old_log, new_log = self.cfg.buckets_log, dropped, "resized flow table");
        }

        while self.qlen > self.cfg.plimit {
            match self.dequeue_inner() {
                Some(_) => self.counters.tail_drops += 1,
                None => break,
            }
        }
        Ok(())
    }

    fn beyond_horizon(&self, packet: &Packet) -> bool {
        packet.tstamp() > self.now_cache + self.ns.horizon
    }

    fn coflow_match(&self, socket_hash: u32) -> bool {
        self.pflowid.iter().any(|id| *id == Some(socket_hash))
    }

    /// Records the flow's identity as a co-flow when the packet's source
    /// port matches one of the configured co-flow ports.
    fn learn_coflow(&mut self, packet: &Packet, fid: FlowId) {
        let sport = u32::from(packet.src_port());
        if self.cfg.f1_source != 0 && sport == self.cfg.f1_source {
            self.pflowid[0] = Some(self.arena[fid].socket_hash);
            trace!(hash = self.arena[fid].socket_hash, "learned co-flow 0");
        }
        if self.cfg.f2_source != 0 && sport == self.cfg.f2_source {
            self.pflowid[1] = Some(self.arena[fid].socket_hash);
            trace!(hash = self.arena[fid].socket_hash, "learned co-flow 1");
        }
    }

    /// Maps a packet to its flow, creating the flow if needed.
    fn classify(&mut self, packet: &mut Packet) -> FlowTarget {
        if packet.is_control() {
            return FlowTarget::Internal;
        }

        // Packets without a usable endpoint are keyed by their masked
        // header hash: handshake replies from listeners (which must not
        // inherit the listener's pacing), and unconnected sockets that fan
        // out to many destinations.
        let endpoint = packet.endpoint().map(|ep| (ep.id(), ep.hash(), ep.state()));
        let (key, socket_hash, owned) = match endpoint {
            None => {
                let hash = packet.hash() & self.cfg.orphan_mask;
                packet.orphan();
                (FlowKey::Synthetic(hash), hash, false)
            }
            Some((_, _, EndpointState::Listener)) => {
                let hash = packet.hash() & self.cfg.orphan_mask;
                packet.orphan();
                (FlowKey::Synthetic(hash), hash, false)
            }
            Some((_, _, EndpointState::Closed)) => {
                let hash = packet.hash() & self.cfg.orphan_mask;
                (FlowKey::Synthetic(hash), hash, false)
            }
            Some((id, hash, EndpointState::Established)) => (FlowKey::Endpoint(id), hash, true),
        };

        if self.flows >= 2 * self.table.buckets() && self.inactive_flows > self.flows / 2 {
            let collected = self.table.gc(&mut self.arena, key, self.now_cache);
            if collected > 0 {
                self.flows -= collected;
                self.inactive_flows -= collected;
                self.counters.gc_flows += u64::from(collected);
                debug!(collected, "garbage collected flows");
            }
        }

        if let Some(fid) = self.table.get(key) {
            if owned {
                // The endpoint may have been torn down and reused for a new
                // connection since this flow was created; start it over
                // with fresh credit.
                let ep_hash = packet.endpoint().map(|ep| ep.hash()).unwrap_or_default();
                if self.arena[fid].socket_hash != ep_hash {
                    let flow = &mut self.arena[fid];
                    flow.credit = self.cfg.initial_quantum as i64;
                    flow.socket_hash = ep_hash;
                    if flow.state == FlowState::Throttled {
                        self.unset_throttled(fid);
                    }
                    self.arena[fid].time_next_packet = 0;
                }
            }
            return FlowTarget::Flow(fid);
        }

        let flow = Flow::new(key, socket_hash, self.cfg.initial_quantum as i64, self.now_cache);
        let Some(fid) = self.arena.insert(flow) else {
            self.counters.allocation_errors += 1;
            return FlowTarget::Internal;
        };
        self.table.insert(key, fid);
        self.flows += 1;
        self.inactive_flows += 1;
        trace!(?key, "created flow");
        FlowTarget::Flow(fid)
    }

    /// Pulls a throttled flow back onto the old list.
    fn unset_throttled(&mut self, fid: FlowId) {
        let deadline = self.arena[fid].time_next_packet;
        let removed = self.throttle.remove(deadline, fid);
        debug_assert!(removed);
        self.lists.push_tail(ListId::Old, fid);
        self.arena[fid].state = FlowState::OnList(ListId::Old);
    }

    /// Releases every flow whose throttle deadline has passed and feeds the
    /// unthrottle-latency EWMA.
    fn check_throttled(&mut self, now: u64) {
        let next = self.throttle.next_deadline();
        if next > now {
            return;
        }
        self.counters.observe_unthrottle_latency(now - next);

        while let Some(fid) = self.throttle.pop_due(now) {
            self.lists.push_tail(ListId::Old, fid);
            self.arena[fid].state = FlowState::OnList(ListId::Old);
        }
    }

    fn dequeue_inner(&mut self) -> Option<Packet> {
        if self.qlen == 0 {
            return None;
        }

        if let Some(packet) = self.internal.pop_next() {
            self.qlen -= 1;
            return Some(packet);
        }

        let now = self.clock.now_ns();
        self.now_cache = now;
        self.check_throttled(now);

        loop {
            // Under a breach the co list is served first; otherwise it only
            // acts as a fallback so enqueue-placed co-flows cannot starve.
            let order = if self.flipflag {
                [ListId::Co, ListId::New, ListId::Old]
            } else {
                [ListId::New, ListId::Old, ListId::Co]
            };
            let Some(head) = self.lists.select(order) else {
                let next = self.throttle.next_deadline();
                if next != u64::MAX {
                    self.watchdog.schedule(next + self.ns.timer_slack);
                } else {
                    self.watchdog.cancel();
                }
                return None;
            };

            let fid = self.lists.head(head).expect("selected list is non-empty");

            // A flow whose identity matches a learned co-flow id is pulled
            // out of the regular discipline into the co list.
            if head != ListId::Co && self.coflow_match(self.arena[fid].socket_hash) {
                self.lists.pop_head(head);
                self.lists.push_tail(ListId::Co, fid);
                self.arena[fid].state = FlowState::OnList(ListId::Co);
                self.ucounter = self.ucounter.saturating_add(1);
                trace!(ucounter = self.ucounter, "promoted co-flow");
                continue;
            }

            if self.ucounter >= self.cfg.coflow_breach && head != ListId::Co && !self.flipflag {
                self.flipflag = true;
                trace!("breach: preferring co list");
                continue;
            }

            if self.ucounter == 0 && head == ListId::Co && self.flipflag {
                self.flipflag = false;
                trace!("breach relieved");
                continue;
            }

            if self.flipflag && head == ListId::Co {
                self.ucounter -= 1;
            }

            if self.arena[fid].credit <= 0 {
                self.arena[fid].credit += self.cfg.quantum as i64;
                self.lists.pop_head(head);
                self.lists.push_tail(ListId::Old, fid);
                self.arena[fid].state = FlowState::OnList(ListId::Old);
                continue;
            }

            let next_time_to_send = self.arena[fid].peek().map(|p| p.time_to_send);
            let Some(time_to_send) = next_time_to_send else {
                // Flow drained. Force one pass through the old list before
                // detaching so backlogged old flows are not starved.
                self.lists.pop_head(head);
                if head != ListId::Old && !self.lists.is_empty(ListId::Old) {
                    self.lists.push_tail(ListId::Old, fid);
                    self.arena[fid].state = FlowState::OnList(ListId::Old);
                } else {
                    self.arena[fid].set_detached(now);
                    self.inactive_flows += 1;
                }
                continue;
            };

            let send_at = time_to_send.max(self.arena[fid].time_next_packet);
            if now < send_at {
                self.lists.pop_head(head);
                self.arena[fid].time_next_packet = send_at;
                self.arena[fid].state = FlowState::Throttled;
                self.throttle.insert(send_at, fid);
                self.counters.throttled += 1;
                continue;
            }

            let mut packet = self.arena[fid].pop_next().expect("peeked packet vanished");
            self.qlen -= 1;
            if now - send_at > self.ns.ce_threshold {
                packet.mark_ce();
                self.counters.ce_mark += 1;
            }

            self.pace(fid, &packet, now);
            return Some(packet);
        }
    }

    /// Debits the flow's credit and computes its next transmit time from
    /// the applicable rate.
    fn pace(&mut self, fid: FlowId, packet: &Packet, now: u64) {
        let plen = u64::from(packet.len());
        self.arena[fid].credit -= plen as i64;

        if !self.cfg.rate_enable {
            return;
        }

        let mut rate = self.cfg.flow_max_rate;
        let mut effective_len = plen;

        // A packet that carried its own departure time already encodes the
        // sender's pacing; only a qdisc-level max rate may slow it further.
        if packet.tstamp() == 0 {
            if let Some(ep) = packet.endpoint() {
                rate = rate.min(ep.pacing_rate());
            }
            if rate <= u64::from(self.cfg.low_rate_threshold) {
                // Slow flows get exactly one packet per round.
                self.arena[fid].credit = 0;
            } else {
                effective_len = effective_len.max(u64::from(self.cfg.quantum));
                if self.arena[fid].credit > 0 {
                    return;
                }
            }
        }

        if rate != u64::MAX {
            let mut delay = effective_len.saturating_mul(NSEC_PER_SEC);
            if rate > 0 {
                delay /= rate;
            }
            // A socket's rate can change later; bound the damage of a
            // too-large packet at one second.
            if delay > NSEC_PER_SEC {
                delay = NSEC_PER_SEC;
                self.counters.pkts_too_long += 1;
            }
            // The timer can fire tens of microseconds late; credit the
            // drift against the next deadline.
            let prev = self.arena[fid].time_next_packet;
            if prev > 0 {
                delay -= (delay / 2).min(now.saturating_sub(prev));
            }
            self.arena[fid].time_next_packet = now + delay;
        }
    }
}
