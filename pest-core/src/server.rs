//! Host-driven API: `Server` receives connection events from the host, returns actions.
//! Owns every peer, every site's targets, deferred visits and policies.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::peer::{ConnId, Peer, Role, Step};
use crate::policy::Policy;
use crate::protocol::{Message, ObservedPopulation, PolicyAction, ProtocolError, TargetPopulation};
use crate::wire;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Write an encoded frame.
    Send(ConnId, Vec<u8>),
    /// Close once everything already sent on the connection is flushed.
    Close(ConnId),
    /// Open a connection to the authority; report back with
    /// `on_authority_connected` or `on_dial_failed`.
    Dial { conn: ConnId, site: u32 },
}

/// Acceptable population range for one species.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRange {
    pub min: u32,
    pub max: u32,
}

impl TargetRange {
    /// Action needed for an observed count, if any. Cull wins when `min > max`.
    pub fn desired_action(&self, count: u32) -> Option<PolicyAction> {
        let mut desired = None;
        if count < self.min {
            desired = Some(PolicyAction::Conserve);
        }
        if count > self.max {
            desired = Some(PolicyAction::Cull);
        }
        desired
    }
}

pub type Targets = BTreeMap<String, TargetRange>;
pub type Observed = HashMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PolicyHandle(u64);

struct DeferredVisit {
    client: ConnId,
    observed: Observed,
}

/// Everything known about one site. Survives authority and client disconnects.
#[derive(Default)]
struct Site {
    targets: Option<Targets>,
    awaiting_targets: bool,
    authority: Option<ConnId>,
    deferred_visits: Vec<DeferredVisit>,
    /// Policies waiting for an id, oldest first.
    pending_creations: VecDeque<PolicyHandle>,
    /// Live (not deleted) policy per species.
    directory: HashMap<String, PolicyHandle>,
    /// Every policy that still has something left to send.
    policies: HashMap<PolicyHandle, Policy>,
    next_handle: u64,
}

impl Site {
    fn needs_deferral(&self) -> bool {
        self.targets.is_none() || self.awaiting_targets
    }

    /// Diff observed against targets; returns the messages for the authority.
    fn reconcile(&mut self, site: u32, observed: &Observed) -> Vec<Message> {
        let Some(targets) = &self.targets else {
            return Vec::new();
        };
        let changes: Vec<(String, Option<PolicyAction>)> = targets
            .iter()
            .filter_map(|(species, range)| {
                let count = observed.get(species).copied().unwrap_or(0);
                let desired = range.desired_action(count);
                let current = self
                    .directory
                    .get(species)
                    .and_then(|h| self.policies.get(h))
                    .map(|p| p.action);
                (desired != current).then(|| (species.clone(), desired))
            })
            .collect();

        let mut out = Vec::new();
        for (species, desired) in changes {
            if let Some(handle) = self.directory.remove(&species) {
                out.extend(self.retire(handle));
            }
            if let Some(action) = desired {
                let handle = PolicyHandle(self.next_handle);
                self.next_handle += 1;
                info!(site, %species, ?action, "creating policy");
                self.policies
                    .insert(handle, Policy::create(site, species.clone(), action));
                self.directory.insert(species.clone(), handle);
                self.pending_creations.push_back(handle);
                out.push(Message::CreatePolicy { species, action });
            }
        }
        out
    }

    fn retire(&mut self, handle: PolicyHandle) -> Option<Message> {
        let policy = self.policies.get_mut(&handle)?;
        info!(site = policy.site, species = %policy.species, policy_id = ?policy.id(), "deleting policy");
        let msg = policy.request_delete();
        if policy.is_settled() {
            self.policies.remove(&handle);
        }
        msg
    }

    /// Hand `id` to the oldest policy waiting for one.
    fn assign_next_id(&mut self, id: u32) -> Option<Message> {
        let Some(handle) = self.pending_creations.pop_front() else {
            debug!(policy_id = id, "no outstanding creation for policy result");
            return None;
        };
        let policy = self.policies.get_mut(&handle)?;
        let msg = policy.assign_id(id);
        debug!(site = policy.site, species = %policy.species, policy_id = id, state = ?policy.state(), "policy id assigned");
        if policy.is_settled() {
            self.policies.remove(&handle);
        }
        msg
    }
}

/// Main coordinator. Host passes events; server returns actions.
pub struct Server {
    next_conn: u64,
    peers: HashMap<ConnId, Peer>,
    sites: HashMap<u32, Site>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            next_conn: 1,
            peers: HashMap::new(),
            sites: HashMap::new(),
        }
    }

    fn allocate_conn(&mut self) -> ConnId {
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;
        conn
    }

    /// New accepted client stream. Returns its handle and our Hello.
    pub fn on_client_connected(&mut self) -> (ConnId, Vec<OutboundAction>) {
        let conn = self.allocate_conn();
        self.peers.insert(conn, Peer::client(conn));
        debug!(%conn, "client connected");
        let mut actions = Vec::new();
        self.send(conn, &Message::hello(), &mut actions);
        (conn, actions)
    }

    /// Dial issued by a `Dial` action succeeded. Releases the held Hello and DialAuthority.
    pub fn on_authority_connected(&mut self, conn: ConnId) -> Vec<OutboundAction> {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return Vec::new();
        };
        info!(%conn, site = ?peer.site(), "authority connected");
        peer.connected()
            .into_iter()
            .map(|frame| OutboundAction::Send(conn, frame))
            .collect()
    }

    /// Dial failed. Visits waiting on it are aborted with an Error to their clients.
    pub fn on_dial_failed(&mut self, conn: ConnId, reason: &str) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let Some(mut peer) = self.peers.remove(&conn) else {
            return actions;
        };
        peer.close();
        let Some(site) = peer.site() else {
            return actions;
        };
        warn!(%conn, site, reason, "authority dial failed");
        let Some(state) = self.sites.get_mut(&site) else {
            return actions;
        };
        if state.authority != Some(conn) {
            return actions;
        }
        state.authority = None;
        state.awaiting_targets = false;
        let aborted = std::mem::take(&mut state.deferred_visits);
        let error = Message::error(format!("failed to connect to authority: {reason}"));
        for visit in aborted {
            self.send(visit.client, &error, &mut actions);
        }
        actions
    }

    /// Stream closed or errored. Site state is left alone.
    pub fn on_connection_closed(&mut self, conn: ConnId) {
        let Some(mut peer) = self.peers.remove(&conn) else {
            return;
        };
        peer.close();
        match peer.role() {
            Role::Client => debug!(%conn, "client disconnected"),
            Role::Authority { site } => {
                info!(%conn, site, "authority disconnected");
                self.detach_authority(conn, site);
            }
        }
    }

    /// Stop routing the site's traffic to `conn`. The next visit dials again.
    fn detach_authority(&mut self, conn: ConnId, site: u32) {
        if let Some(state) = self.sites.get_mut(&site) {
            if state.authority == Some(conn) {
                state.authority = None;
            }
        }
    }

    /// Bytes arrived on `conn`. Decodes and dispatches every complete frame.
    pub fn on_bytes_received(&mut self, conn: ConnId, bytes: &[u8]) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        match self.peers.get_mut(&conn) {
            Some(peer) => peer.push_bytes(bytes),
            None => return actions,
        }
        loop {
            let step = match self.peers.get_mut(&conn) {
                Some(peer) => peer.poll(),
                None => break,
            };
            match step {
                Step::Incomplete => break,
                Step::Consumed => {}
                Step::Deliver(msg) => {
                    if let Err(e) = self.dispatch(conn, msg, &mut actions) {
                        self.report(conn, &e, &mut actions);
                    }
                }
                Step::Failed(e) => {
                    self.report(conn, &e, &mut actions);
                    if e.is_fatal() {
                        actions.push(OutboundAction::Close(conn));
                        if let Some(site) = self.peers.get(&conn).and_then(Peer::site) {
                            self.detach_authority(conn, site);
                        }
                        break;
                    }
                }
            }
        }
        actions
    }

    fn dispatch(
        &mut self,
        conn: ConnId,
        msg: Message,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), ProtocolError> {
        let role = match self.peers.get(&conn) {
            Some(peer) => peer.role(),
            None => return Ok(()),
        };
        match (role, msg) {
            (Role::Client, Message::SiteVisit { site, populations }) => {
                self.handle_site_visit(conn, site, populations, actions)
            }
            (Role::Authority { .. }, Message::TargetPopulations { site, populations }) => {
                self.handle_target_populations(conn, site, populations, actions)
            }
            (Role::Authority { .. }, Message::PolicyResult { policy_id }) => {
                self.handle_policy_result(conn, policy_id, actions);
                Ok(())
            }
            (_, other) => Err(ProtocolError::UnexpectedMessageType(other.kind().as_byte())),
        }
    }

    /// A client reported populations at `site`.
    pub fn handle_site_visit(
        &mut self,
        client: ConnId,
        site: u32,
        populations: Vec<ObservedPopulation>,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), ProtocolError> {
        let observed = collect_observed(populations)?;
        debug!(conn = %client, site, ?observed, "site visit");
        self.ensure_authority(site, actions);
        let state = self.sites.entry(site).or_default();
        if state.needs_deferral() {
            debug!(conn = %client, site, "targets unknown, deferring visit");
            state.deferred_visits.push(DeferredVisit { client, observed });
            return Ok(());
        }
        self.reconcile(site, &observed, actions);
        Ok(())
    }

    /// The authority for `site` declared its targets. Replays deferred visits.
    pub fn handle_target_populations(
        &mut self,
        authority: ConnId,
        site: u32,
        populations: Vec<TargetPopulation>,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), ProtocolError> {
        let targets = collect_targets(populations)?;
        let expected = self.peers.get(&authority).and_then(Peer::site);
        if expected != Some(site) {
            return Err(ProtocolError::SiteMismatch {
                expected: expected.unwrap_or_default(),
                actual: site,
            });
        }
        info!(conn = %authority, site, species = targets.len(), "target populations received");
        let state = self.sites.entry(site).or_default();
        state.targets = Some(targets);
        state.awaiting_targets = false;
        let deferred = std::mem::take(&mut state.deferred_visits);
        for visit in deferred {
            debug!(conn = %visit.client, site, "replaying deferred visit");
            self.reconcile(site, &visit.observed, actions);
        }
        Ok(())
    }

    /// Correlate a PolicyResult with the oldest outstanding CreatePolicy for the site.
    pub fn handle_policy_result(
        &mut self,
        authority: ConnId,
        policy_id: u32,
        actions: &mut Vec<OutboundAction>,
    ) {
        let Some(site) = self.peers.get(&authority).and_then(Peer::site) else {
            return;
        };
        let msg = self
            .sites
            .get_mut(&site)
            .and_then(|state| state.assign_next_id(policy_id));
        if let Some(msg) = msg {
            self.send(authority, &msg, actions);
        }
    }

    /// Create and delete policies so that `observed` ends up within the site's targets.
    pub fn reconcile(&mut self, site: u32, observed: &Observed, actions: &mut Vec<OutboundAction>) {
        let Some(state) = self.sites.get_mut(&site) else {
            return;
        };
        let Some(authority) = state.authority else {
            debug!(site, "no authority connection, skipping reconcile");
            return;
        };
        for msg in state.reconcile(site, observed) {
            self.send(authority, &msg, actions);
        }
    }

    /// Dial the site's authority unless a connection exists or is being set up.
    fn ensure_authority(&mut self, site: u32, actions: &mut Vec<OutboundAction>) {
        if self.authority_conn(site).is_some() {
            return;
        }
        let conn = self.allocate_conn();
        self.peers.insert(conn, Peer::authority(conn, site));
        let state = self.sites.entry(site).or_default();
        state.authority = Some(conn);
        state.awaiting_targets = true;
        info!(%conn, site, "dialing authority");
        actions.push(OutboundAction::Dial { conn, site });
        self.send(conn, &Message::hello(), actions);
        self.send(conn, &Message::DialAuthority { site }, actions);
    }

    fn report(&mut self, conn: ConnId, err: &ProtocolError, actions: &mut Vec<OutboundAction>) {
        warn!(%conn, error = %err, fatal = err.is_fatal(), "protocol error");
        self.send(conn, &Message::error(err), actions);
    }

    fn send(&mut self, conn: ConnId, msg: &Message, actions: &mut Vec<OutboundAction>) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            debug!(%conn, ?msg, "dropping message for closed connection");
            return;
        };
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%conn, error = %e, "failed to encode message");
                return;
            }
        };
        debug!(%conn, "-> {}", wire::hex_dump(&frame));
        if peer.is_connecting() {
            peer.hold(frame);
        } else {
            actions.push(OutboundAction::Send(conn, frame));
        }
    }

    pub fn targets(&self, site: u32) -> Option<&Targets> {
        self.sites.get(&site).and_then(|s| s.targets.as_ref())
    }

    pub fn is_awaiting_targets(&self, site: u32) -> bool {
        self.sites.get(&site).is_some_and(|s| s.awaiting_targets)
    }

    pub fn authority_conn(&self, site: u32) -> Option<ConnId> {
        self.sites.get(&site).and_then(|s| s.authority)
    }

    pub fn deferred_visit_count(&self, site: u32) -> usize {
        self.sites.get(&site).map_or(0, |s| s.deferred_visits.len())
    }

    pub fn pending_creation_count(&self, site: u32) -> usize {
        self.sites.get(&site).map_or(0, |s| s.pending_creations.len())
    }

    /// Live policy for (site, species).
    pub fn policy(&self, site: u32, species: &str) -> Option<&Policy> {
        let state = self.sites.get(&site)?;
        state.directory.get(species).and_then(|h| state.policies.get(h))
    }

    pub fn peer(&self, conn: ConnId) -> Option<&Peer> {
        self.peers.get(&conn)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_observed(populations: Vec<ObservedPopulation>) -> Result<Observed, ProtocolError> {
    let mut observed = Observed::new();
    for p in populations {
        match observed.get(&p.species) {
            Some(&count) if count != p.count => {
                return Err(ProtocolError::ConflictingCounts { species: p.species })
            }
            Some(_) => {}
            None => {
                observed.insert(p.species, p.count);
            }
        }
    }
    Ok(observed)
}

fn collect_targets(populations: Vec<TargetPopulation>) -> Result<Targets, ProtocolError> {
    let mut targets = Targets::new();
    for p in populations {
        let range = TargetRange {
            min: p.min,
            max: p.max,
        };
        match targets.get(&p.species) {
            Some(existing) if *existing != range => {
                return Err(ProtocolError::ConflictingTarget { species: p.species })
            }
            Some(_) => {}
            None => {
                targets.insert(p.species, range);
            }
        }
    }
    Ok(targets)
}
