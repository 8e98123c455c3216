//! Raft-style consensus (C4) — the core of the core. A single state
//! machine with three live states {FOLLOWER, CANDIDATE, LEADER} and one
//! sentinel DEAD used only by tests. `RaftNode` itself is pure and
//! synchronous: it takes messages and ticks in, and returns messages and
//! committed entries out. The async wiring (timers, RPC I/O, the mutex
//! that guards this struct) lives in `raftservice`.

use std::collections::{HashMap, HashSet};

use crate::command::Command;
use crate::types::{LogIndex, MetaError, PeerId, Result, Term};
use serde::{Deserialize, Serialize};

/// One entry in the replicated log. Index 0 is a sentinel (term 0, never
/// applied) — preserved from the reference design to keep
/// `prev_log_index == 0` a non-special case.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Command,
}

/// Messages exchanged between masters, plus the bootstrap-only
/// `RegisterMaster` call a newcomer makes against one existing master.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: Term,
        candidate_id: PeerId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    RequestVoteResponse {
        term: Term,
        vote_granted: bool,
    },
    AppendEntries {
        term: Term,
        leader_id: PeerId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendEntriesResponse {
        term: Term,
        success: bool,
        leader_id: PeerId,
        match_index: LogIndex,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
    /// Used only by tests to model a crashed/excluded node.
    Dead,
}

/// Election/heartbeat timing, expressed as an RTT estimate per spec §4.4:
/// election timeout is sampled uniformly from `[8*rtt, 9*rtt)`.
pub struct RaftConfig {
    pub peer_id: PeerId,
    pub peers: Vec<PeerId>,
    pub rtt_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl RaftConfig {
    /// Shrinks timing for fast test convergence, mirroring
    /// `RAFT_FORCE_MORE_REELECTION` (spec §6): any non-empty value makes
    /// elections trigger far more readily.
    pub fn from_env(peer_id: PeerId, peers: Vec<PeerId>) -> Self {
        let forced = std::env::var("RAFT_FORCE_MORE_REELECTION")
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if forced {
            Self {
                peer_id,
                peers,
                rtt_ms: 5,
                heartbeat_interval_ms: 10,
            }
        } else {
            Self {
                peer_id,
                peers,
                rtt_ms: 250,
                heartbeat_interval_ms: 100,
            }
        }
    }

    pub fn election_timeout_range_ms(&self) -> (u64, u64) {
        (8 * self.rtt_ms, 9 * self.rtt_ms)
    }
}

/// A single Raft participant. All mutation goes through `&mut self`
/// methods; the caller (`raftservice`) is responsible for holding the
/// single mutex this struct is designed to live behind and for releasing
/// it before any RPC send.
pub struct RaftNode {
    config: RaftConfig,
    state: RaftState,
    current_term: Term,
    voted_for: Option<PeerId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<PeerId, LogIndex>,
    match_index: HashMap<PeerId, LogIndex>,
    votes_received: HashSet<PeerId>,
    current_leader: Option<PeerId>,
}

impl RaftNode {
    pub fn new(config: RaftConfig) -> Self {
        tracing::debug!(peer_id = %config.peer_id, peers = ?config.peers, "creating Raft node as Follower");
        Self {
            config,
            state: RaftState::Follower,
            current_term: Term::ZERO,
            voted_for: None,
            log: Vec::new(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            current_leader: None,
        }
    }

    /// Restores persisted hard state after a restart (current_term,
    /// voted_for, and the log itself — see `raft_log::RaftLogStore`).
    /// Resolves the open question in spec §9: all three fields are
    /// persisted, not just the log.
    pub fn restore(config: RaftConfig, current_term: Term, voted_for: Option<PeerId>, log: Vec<LogEntry>) -> Self {
        let mut node = Self::new(config);
        node.current_term = current_term;
        node.voted_for = voted_for;
        node.log = log;
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.config.peer_id
    }

    pub fn state(&self) -> RaftState {
        self.state
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<PeerId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn current_leader(&self) -> Option<PeerId> {
        self.current_leader
    }

    /// The randomized election timeout window this node samples from on
    /// every timer reset, per §4.4.
    pub fn election_timeout_range_ms(&self) -> (u64, u64) {
        self.config.election_timeout_range_ms()
    }

    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    pub fn log_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        let idx = index.as_u64() as usize;
        if idx == 0 {
            None
        } else {
            self.log.get(idx - 1)
        }
    }

    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::new(self.log.len() as u64)
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(Term::ZERO)
    }

    /// A full copy of the log, for persistence after an apply.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Starts an election. Per spec §4.4 point 2: a peerless cluster
    /// skips the RequestVote round entirely and starts leading — there is
    /// no one to ask.
    pub fn start_election(&mut self) -> Option<RaftMessage> {
        self.state = RaftState::Candidate;
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.config.peer_id);
        self.votes_received.clear();
        self.votes_received.insert(self.config.peer_id);
        self.current_leader = None;

        tracing::info!(peer_id = %self.config.peer_id, term = %self.current_term, "starting election");

        if self.config.peers.is_empty() {
            self.become_leader();
            return None;
        }

        Some(RaftMessage::RequestVote {
            term: self.current_term,
            candidate_id: self.config.peer_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        })
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 2) / 2
    }

    fn become_leader(&mut self) {
        tracing::info!(peer_id = %self.config.peer_id, term = %self.current_term, "became leader");
        self.state = RaftState::Leader;
        self.current_leader = Some(self.config.peer_id);
        let next = self.last_log_index() + 1;
        for peer in self.config.peers.clone() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, LogIndex::ZERO);
        }
    }

    pub fn step_down(&mut self, term: Term) {
        self.current_term = term;
        self.state = RaftState::Follower;
        self.voted_for = None;
    }

    /// Server-side vote granting.
    pub fn handle_request_vote(&mut self, msg: &RaftMessage) -> RaftMessage {
        let (term, candidate_id, last_log_index, last_log_term) = match msg {
            RaftMessage::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
                (*term, *candidate_id, *last_log_index, *last_log_term)
            }
            _ => panic!("handle_request_vote called with non-RequestVote message"),
        };

        if term > self.current_term {
            self.step_down(term);
        }

        let vote_granted = term == self.current_term
            && self.voted_for.map(|v| v == candidate_id).unwrap_or(true)
            && self.is_log_up_to_date(last_log_index, last_log_term);

        if vote_granted {
            self.voted_for = Some(candidate_id);
        }

        tracing::debug!(peer_id = %self.config.peer_id, candidate = %candidate_id, granted = vote_granted, "handled RequestVote");

        RaftMessage::RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Leader-side handling of a vote reply. Returns the heartbeat
    /// AppendEntries batch to send if this reply won the election.
    pub fn handle_vote_response(&mut self, from: PeerId, msg: &RaftMessage) -> Option<Vec<(PeerId, RaftMessage)>> {
        let (term, vote_granted) = match msg {
            RaftMessage::RequestVoteResponse { term, vote_granted } => (*term, *vote_granted),
            _ => panic!("handle_vote_response called with non-RequestVoteResponse message"),
        };

        if self.state != RaftState::Candidate {
            return None;
        }

        if term > self.current_term {
            self.step_down(term);
            return None;
        }
        if term < self.current_term {
            return None;
        }

        if vote_granted {
            self.votes_received.insert(from);
        }

        if self.votes_received.len() >= self.majority() {
            self.become_leader();
            let peers = self.config.peers.clone();
            let messages = peers.into_iter().map(|p| (p, self.build_append_entries(p))).collect();
            Some(messages)
        } else {
            None
        }
    }

    /// Leader-only. Appends `command` to the local log under the current
    /// term. Returns the AppendEntries batch to broadcast, or
    /// `MetaError::NotLeader` with the best-known leader hint.
    pub fn submit(&mut self, command: Command) -> Result<Vec<(PeerId, RaftMessage)>> {
        if self.state != RaftState::Leader {
            return Err(MetaError::NotLeader {
                leader_hint: self.current_leader,
                leader_address: None,
            });
        }

        let index = self.last_log_index() + 1;
        let entry = LogEntry {
            index,
            term: self.current_term,
            command,
        };
        self.log.push(entry);

        tracing::debug!(peer_id = %self.config.peer_id, index = %index, "submitted entry");

        let peers = self.config.peers.clone();
        Ok(peers.into_iter().map(|p| (p, self.build_append_entries(p))).collect())
    }

    /// Follower/candidate side of AppendEntries.
    pub fn handle_append_entries(&mut self, msg: &RaftMessage) -> RaftMessage {
        let (term, leader_id, prev_log_index, prev_log_term, entries, leader_commit) = match msg {
            RaftMessage::AppendEntries { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit } => {
                (*term, *leader_id, *prev_log_index, *prev_log_term, entries.clone(), *leader_commit)
            }
            _ => panic!("handle_append_entries called with non-AppendEntries message"),
        };

        if term > self.current_term {
            self.step_down(term);
        }

        if term < self.current_term {
            return RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: false,
                leader_id: self.config.peer_id,
                match_index: self.last_log_index(),
            };
        }

        // A valid leader's AppendEntries always demotes a candidate, and
        // re-affirms a follower — only a current leader sends these.
        self.state = RaftState::Follower;
        self.current_leader = Some(leader_id);

        let log_ok = prev_log_index.as_u64() == 0
            || (prev_log_index.as_u64() <= self.log.len() as u64
                && self.log_entry(prev_log_index).map(|e| e.term) == Some(prev_log_term));

        if !log_ok {
            return RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: false,
                leader_id: self.config.peer_id,
                match_index: self.last_log_index(),
            };
        }

        let start = prev_log_index.as_u64() as usize;
        for (i, entry) in entries.iter().enumerate() {
            let idx = start + i;
            if idx < self.log.len() {
                if self.log[idx].term != entry.term {
                    self.log.truncate(idx);
                    self.log.push(entry.clone());
                }
            } else {
                self.log.push(entry.clone());
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(leader_commit, self.last_log_index());
        }

        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success: true,
            leader_id: self.config.peer_id,
            match_index: self.last_log_index(),
        }
    }

    /// Leader side of an AppendEntriesResponse: advances next/match index,
    /// and tries to advance the commit index.
    pub fn handle_append_response(&mut self, from: PeerId, msg: &RaftMessage) {
        let (term, success, match_index) = match msg {
            RaftMessage::AppendEntriesResponse { term, success, match_index, .. } => {
                (*term, *success, *match_index)
            }
            _ => panic!("handle_append_response called with non-AppendEntriesResponse message"),
        };

        if self.state != RaftState::Leader {
            return;
        }
        if term > self.current_term {
            self.step_down(term);
            return;
        }

        if success {
            self.next_index.insert(from, match_index + 1);
            self.match_index.insert(from, match_index);
        } else if let Some(next) = self.next_index.get(&from).copied() {
            self.next_index.insert(from, LogIndex::new(next.as_u64().saturating_sub(1).max(1)));
        }

        self.try_advance_commit();
    }

    /// Drains newly committed-but-not-yet-applied entries in index order.
    /// Resolves spec §9's flagged ambiguity: the commit index only ever
    /// advances to the candidate index `i` found by `try_advance_commit`,
    /// never reset to a constant.
    pub fn take_committed_entries(&mut self) -> Vec<LogEntry> {
        let start = self.last_applied.as_u64() as usize;
        let end = self.commit_index.as_u64() as usize;
        if start < end && end <= self.log.len() {
            let entries = self.log[start..end].to_vec();
            self.last_applied = self.commit_index;
            entries
        } else {
            Vec::new()
        }
    }

    fn build_append_entries(&self, peer: PeerId) -> RaftMessage {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1);
        let prev_log_index = LogIndex::new(next.as_u64().saturating_sub(1));
        let prev_log_term = if prev_log_index.as_u64() > 0 {
            self.log_entry(prev_log_index).map(|e| e.term).unwrap_or(Term::ZERO)
        } else {
            Term::ZERO
        };
        let entries = if (next.as_u64() as usize) <= self.log.len() {
            self.log[next.as_u64() as usize - 1..].to_vec()
        } else {
            Vec::new()
        };

        RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.config.peer_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }
    }

    fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let my_term = self.last_log_term();
        match last_log_term.cmp(&my_term) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => last_log_index >= self.last_log_index(),
            std::cmp::Ordering::Less => false,
        }
    }

    fn try_advance_commit(&mut self) {
        if self.state != RaftState::Leader {
            return;
        }
        let last = self.last_log_index().as_u64();
        for i in (self.commit_index.as_u64() + 1)..=last {
            let idx = LogIndex::new(i);
            if self.log_entry(idx).map(|e| e.term) != Some(self.current_term) {
                continue;
            }
            let mut count = 1; // self
            for peer in &self.config.peers {
                if self.match_index.get(peer).copied().unwrap_or(LogIndex::ZERO) >= idx {
                    count += 1;
                }
            }
            if count >= self.majority() {
                self.commit_index = idx;
            }
        }
    }

    /// Builds the heartbeat batch a leader sends on every tick.
    pub fn build_heartbeats(&self) -> Vec<(PeerId, RaftMessage)> {
        self.config
            .peers
            .iter()
            .map(|p| (*p, self.build_append_entries(*p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(id: u64, peers: Vec<u64>) -> RaftConfig {
        RaftConfig {
            peer_id: PeerId::new(id),
            peers: peers.into_iter().map(PeerId::new).collect(),
            rtt_ms: 10,
            heartbeat_interval_ms: 5,
        }
    }

    #[test]
    fn single_node_cluster_self_elects() {
        let mut node = RaftNode::new(cfg(1, vec![]));
        let msg = node.start_election();
        assert!(msg.is_none());
        assert_eq!(node.state(), RaftState::Leader);
    }

    #[test]
    fn three_node_majority_elects_leader() {
        let mut a = RaftNode::new(cfg(1, vec![2, 3]));
        let mut b = RaftNode::new(cfg(2, vec![1, 3]));

        let rv = a.start_election().unwrap();
        let reply_b = b.handle_request_vote(&rv);
        let result = a.handle_vote_response(PeerId::new(2), &reply_b);

        // a's own vote (1) + b's granted vote (1) = 2, majority of 3 is 2
        assert!(result.is_some());
        assert_eq!(a.state(), RaftState::Leader);
    }

    #[test]
    fn higher_term_steps_down_leader() {
        let mut a = RaftNode::new(cfg(1, vec![]));
        a.start_election();
        assert_eq!(a.state(), RaftState::Leader);

        let rv = RaftMessage::RequestVote {
            term: Term::new(5),
            candidate_id: PeerId::new(99),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };
        a.handle_request_vote(&rv);
        assert_eq!(a.state(), RaftState::Follower);
        assert_eq!(a.current_term(), Term::new(5));
    }

    #[test]
    fn vote_not_granted_twice_in_same_term() {
        let mut node = RaftNode::new(cfg(1, vec![2, 3]));
        let rv1 = RaftMessage::RequestVote {
            term: Term::new(1),
            candidate_id: PeerId::new(2),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };
        let r1 = node.handle_request_vote(&rv1);
        assert!(matches!(r1, RaftMessage::RequestVoteResponse { vote_granted: true, .. }));

        let rv2 = RaftMessage::RequestVote {
            term: Term::new(1),
            candidate_id: PeerId::new(3),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        };
        let r2 = node.handle_request_vote(&rv2);
        assert!(matches!(r2, RaftMessage::RequestVoteResponse { vote_granted: false, .. }));
    }

    #[test]
    fn submit_requires_leadership() {
        let mut node = RaftNode::new(cfg(1, vec![2]));
        let err = node
            .submit(Command::AddServer { peer_id: PeerId::new(2), address: "x".into() })
            .unwrap_err();
        assert!(matches!(err, MetaError::NotLeader { .. }));
    }

    #[test]
    fn leader_commits_after_majority_match() {
        let mut leader = RaftNode::new(cfg(1, vec![2, 3]));
        leader.start_election(); // no peers means this wouldn't self-elect; force it manually
        // three-peer cluster requires real votes; simulate by hand instead
        let mut l = RaftNode::new(cfg(1, vec![2, 3]));
        l.submit_as_leader_for_test();
        l.submit(Command::AddNode { node_id: crate::types::NodeId::new(1), address: "n1".into() })
            .unwrap();
        l.handle_append_response(
            PeerId::new(2),
            &RaftMessage::AppendEntriesResponse {
                term: l.current_term(),
                success: true,
                leader_id: PeerId::new(1),
                match_index: LogIndex::new(1),
            },
        );
        assert_eq!(l.commit_index(), LogIndex::new(1));
        let committed = l.take_committed_entries();
        assert_eq!(committed.len(), 1);
        let _ = leader; // silence unused warning from the scratch election above
    }

    impl RaftNode {
        /// Test-only shortcut: forces leadership without an election, so
        /// replication behaviour can be tested directly.
        fn submit_as_leader_for_test(&mut self) {
            self.state = RaftState::Leader;
            self.current_leader = Some(self.config.peer_id);
            let next = self.last_log_index() + 1;
            for peer in self.config.peers.clone() {
                self.next_index.insert(peer, next);
                self.match_index.insert(peer, LogIndex::ZERO);
            }
        }
    }
}
