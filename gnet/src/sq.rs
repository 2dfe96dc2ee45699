// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Search queues: pacing of outgoing query messages.
//!
//! Every search puts at most one pending query into a queue; dispatch is
//! LIFO (the most recent search is the most urgent one) and throttled by
//! `search_queue_spacing`. Per-peer queues feed one node's outbound message
//! queue; the global queue, active only in ultrapeer mode, feeds the
//! dynamic-query launcher.
//!
//! The outside world -- node flags, the search subsystem's veto, the
//! transports -- is reached through the [`SearchIo`] seam.

use std::{
    collections::VecDeque,
    fmt::{self, Display},
};

use rustc_hash::FxHashSet;

use crate::{clock::Timestamp, config::Config};

/// Opaque handle of a search, issued by the search subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SearchHandle(pub u32);

impl Display for SearchHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "search:{}", self.0)
    }
}

/// Opaque handle of a connected node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Role of the local node in the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerMode {
    Leaf,
    Normal,
    Ultra,
}

/// Hashed query keywords, carried by global-queue entries for the
/// dynamic-query launcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryHashVector(pub Vec<u32>);

/// Attached to a query dispatched by a leaf: the transport reports it to
/// the search subsystem when the message is actually written out, so the
/// search can start its retry timer from the true send time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryNotice {
    pub search: SearchHandle,
    pub node: NodeId,
}

/// A query handed over to a node's outbound message queue.
#[derive(Debug)]
pub struct OutboundQuery {
    pub search: SearchHandle,
    pub data: Vec<u8>,
    pub notice: Option<QueryNotice>,
}

/// Dispatch-relevant state of one connected node.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeView {
    pub writable: bool,
    pub flow_controlled: bool,
    /// Messages received from the node so far; a node that has not spoken
    /// yet is not queried.
    pub received: u64,
    /// Hops-flow: whether the node currently accepts hops=0 queries.
    pub accepts_zero_hop: bool,
}

/// Everything a search queue needs from the rest of the client.
pub trait SearchIo {
    fn peer_mode(&self) -> PeerMode;

    /// Currently connected ultrapeer neighbours.
    fn connected_ultrapeers(&self) -> usize;

    /// The search subsystem's veto: may this search emit a query now?
    fn query_allowed(&mut self, search: SearchHandle) -> bool;

    /// `None` when the node is gone.
    fn node_view(&self, node: NodeId) -> Option<NodeView>;

    /// Hand a query to the node's outbound message queue.
    fn deliver(&mut self, node: NodeId, query: OutboundQuery);

    /// Hand a query to the dynamic-query launcher.
    fn launch(&mut self, search: SearchHandle, data: Vec<u8>, qhv: Option<QueryHashVector>);
}

struct SMsg {
    search: SearchHandle,
    data: Vec<u8>,
    qhv: Option<QueryHashVector>,
}

/// A search queue; one per connected peer, plus one global instance.
pub struct Sq {
    node: Option<NodeId>,
    /// Head is the newest entry.
    items: VecDeque<SMsg>,
    handles: FxHashSet<SearchHandle>,
    sent: u64,
    dropped: u64,
    last_sent: Option<Timestamp>,
}

impl Sq {
    /// A queue bound to one peer.
    pub fn new(node: NodeId) -> Self {
        Self::make(Some(node))
    }

    /// The global queue, dispatching through the dynamic-query launcher.
    pub fn global() -> Self {
        Self::make(None)
    }

    fn make(node: Option<NodeId>) -> Self {
        Self {
            node,
            items: VecDeque::new(),
            handles: FxHashSet::default(),
            sent: 0,
            dropped: 0,
            last_sent: None,
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_sent(&self) -> Option<Timestamp> {
        self.last_sent
    }

    /// Queue a message for `search`. If the search already has a pending
    /// entry the message is silently dropped: one query per search.
    pub fn put(&mut self, search: SearchHandle, data: Vec<u8>, cfg: &Config) {
        self.insert(
            SMsg {
                search,
                data,
                qhv: None,
            },
            cfg,
        )
    }

    /// Queue a message on the global queue, with its query-hash vector for
    /// the dynamic-query launcher.
    pub fn global_put(
        &mut self,
        search: SearchHandle,
        data: Vec<u8>,
        qhv: Option<QueryHashVector>,
        cfg: &Config,
    ) {
        debug_assert!(self.node.is_none(), "query-hash vectors go to the global queue");
        self.insert(SMsg { search, data, qhv }, cfg)
    }

    fn insert(&mut self, msg: SMsg, cfg: &Config) {
        if !self.handles.insert(msg.search) {
            tracing::trace!(search = %msg.search, "search already queued, message dropped");
            return;
        }
        self.items.push_front(msg);
        while self.items.len() > cfg.search_queue_size {
            if let Some(old) = self.items.pop_back() {
                self.handles.remove(&old.search);
                self.dropped += 1;
                tracing::trace!(search = %old.search, "queue over capacity, oldest dropped");
            }
        }
    }

    /// Attempt to dispatch one message. At most one query leaves the queue
    /// per `search_queue_spacing` seconds.
    pub fn process<IO>(&mut self, now: Timestamp, cfg: &Config, io: &mut IO)
    where
        IO: SearchIo,
    {
        if self.items.is_empty() {
            return;
        }
        if let Some(last) = self.last_sent {
            if now - last < i64::from(cfg.search_queue_spacing) {
                return;
            }
        }
        match self.node {
            Some(node) => self.process_node(node, now, io),
            None => self.process_global(now, cfg, io),
        }
    }

    fn process_node<IO>(&mut self, node: NodeId, now: Timestamp, io: &mut IO)
    where
        IO: SearchIo,
    {
        let view = match io.node_view(node) {
            Some(view) => view,
            None => return,
        };
        if view.received == 0 || !view.accepts_zero_hop || !view.writable || view.flow_controlled {
            return;
        }
        // Pop until something dispatches: a vetoed message is discarded and
        // the next one tried, so the throttle spacing is not wasted on it.
        while let Some(msg) = self.items.pop_front() {
            self.handles.remove(&msg.search);
            if !io.query_allowed(msg.search) {
                self.dropped += 1;
                tracing::trace!(search = %msg.search, "query vetoed, discarded");
                continue;
            }
            let notice = if io.peer_mode() == PeerMode::Leaf {
                Some(QueryNotice {
                    search: msg.search,
                    node,
                })
            } else {
                None
            };
            io.deliver(
                node,
                OutboundQuery {
                    search: msg.search,
                    data: msg.data,
                    notice,
                },
            );
            self.sent += 1;
            self.last_sent = Some(now);
            return;
        }
    }

    fn process_global<IO>(&mut self, now: Timestamp, cfg: &Config, io: &mut IO)
    where
        IO: SearchIo,
    {
        if io.peer_mode() != PeerMode::Ultra {
            return;
        }
        if io.connected_ultrapeers() < cfg.up_connections * 2 / 3 {
            return;
        }
        if let Some(msg) = self.items.pop_front() {
            self.handles.remove(&msg.search);
            io.launch(msg.search, msg.data, msg.qhv);
            self.sent += 1;
            self.last_sent = Some(now);
        }
    }

    /// Flush the backlog, counting it as dropped.
    pub fn clear(&mut self) {
        self.dropped += self.items.len() as u64;
        self.items.clear();
        self.handles.clear();
    }

    /// Remove whatever `search` still has queued. Idempotent.
    pub fn search_closed(&mut self, search: SearchHandle) {
        if self.handles.remove(&search) {
            self.items.retain(|msg| msg.search != search);
        }
    }
}
