//! Membership view and the merge rules applied to gossiped member states.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::{Duration, Instant},
};

use bincode::{Decode, Encode};
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

/// One node as seen through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Member {
    pub name: String,
    /// Gossip address
    pub addr: SocketAddr,
    pub tags: BTreeMap<String, String>,
    /// Start time of the member's process; a restart supersedes old state
    pub incarnation: u64,
    pub heartbeat: u64,
    pub status: MemberStatus,
}

impl Member {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Joined(Member),
    Left(Member),
    Failed(Member),
}

struct Entry {
    member: Member,
    /// Last time the heartbeat advanced
    last_seen: Instant,
}

/// The local node's view of the cluster.
pub struct MemberTable {
    local: Member,
    remotes: HashMap<String, Entry>,
}

impl MemberTable {
    pub fn new(local: Member) -> Self {
        Self {
            local,
            remotes: HashMap::new(),
        }
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        if name == self.local.name {
            return Some(&self.local);
        }
        self.remotes.get(name).map(|e| &e.member)
    }

    pub fn tick(&mut self) {
        self.local.heartbeat += 1;
    }

    pub fn leave_local(&mut self) {
        self.local.status = MemberStatus::Left;
        self.local.heartbeat += 1;
    }

    /// Fold a gossiped state into the view. State about the local node is
    /// ignored.
    pub fn merge(&mut self, remote: Member, now: Instant) -> Option<MemberEvent> {
        if remote.name == self.local.name {
            return None;
        }

        let Some(entry) = self.remotes.get_mut(&remote.name) else {
            let event = (remote.status == MemberStatus::Alive)
                .then(|| MemberEvent::Joined(remote.clone()));
            self.remotes.insert(
                remote.name.clone(),
                Entry {
                    member: remote,
                    last_seen: now,
                },
            );
            return event;
        };

        let (incarnation, status, heartbeat) = (
            entry.member.incarnation,
            entry.member.status,
            entry.member.heartbeat,
        );
        if remote.incarnation < incarnation {
            return None;
        }

        if remote.incarnation > incarnation {
            let was_alive = status == MemberStatus::Alive;
            let event = match remote.status {
                MemberStatus::Alive => Some(MemberEvent::Joined(remote.clone())),
                MemberStatus::Left if was_alive => Some(MemberEvent::Left(remote.clone())),
                _ => None,
            };
            entry.member = remote;
            entry.last_seen = now;
            return event;
        }

        match (status, remote.status) {
            (MemberStatus::Left, _) => None,
            (status, MemberStatus::Left) => {
                entry.member.status = MemberStatus::Left;
                entry.member.heartbeat = heartbeat.max(remote.heartbeat);
                entry.last_seen = now;
                (status == MemberStatus::Alive).then(|| MemberEvent::Left(entry.member.clone()))
            }
            (status, MemberStatus::Alive) if remote.heartbeat > heartbeat => {
                entry.member.heartbeat = remote.heartbeat;
                entry.member.addr = remote.addr;
                entry.member.tags = remote.tags;
                entry.last_seen = now;
                if status == MemberStatus::Failed {
                    entry.member.status = MemberStatus::Alive;
                    return Some(MemberEvent::Joined(entry.member.clone()));
                }
                None
            }
            _ => None,
        }
    }

    /// Mark alive members whose heartbeat has stalled for longer than
    /// `timeout` as failed.
    pub fn expire(&mut self, timeout: Duration, now: Instant) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        for entry in self.remotes.values_mut() {
            if entry.member.status == MemberStatus::Alive
                && now.saturating_duration_since(entry.last_seen) > timeout
            {
                entry.member.status = MemberStatus::Failed;
                events.push(MemberEvent::Failed(entry.member.clone()));
            }
        }
        events
    }

    /// States worth passing on: everything except failed members.
    pub fn gossip_view(&self) -> Vec<Member> {
        std::iter::once(&self.local)
            .chain(self.remotes.values().map(|e| &e.member))
            .filter(|m| m.status != MemberStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn alive_peers(&self) -> Vec<SocketAddr> {
        self.remotes
            .values()
            .filter(|e| e.member.status == MemberStatus::Alive)
            .map(|e| e.member.addr)
            .collect()
    }

    /// Up to `n` alive peers, chosen at random.
    pub fn random_peers(&self, n: usize) -> Vec<SocketAddr> {
        let mut peers = self.alive_peers();
        peers.shuffle(&mut rand::rng());
        peers.truncate(n);
        peers
    }

    /// Every known member, local included, sorted by name.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = std::iter::once(self.local.clone())
            .chain(self.remotes.values().map(|e| e.member.clone()))
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, port: u16, incarnation: u64, heartbeat: u64) -> Member {
        Member {
            name: name.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            tags: BTreeMap::from([("rpc_addr".to_string(), format!("127.0.0.1:{}", port + 1))]),
            incarnation,
            heartbeat,
            status: MemberStatus::Alive,
        }
    }

    fn with_status(mut m: Member, status: MemberStatus) -> Member {
        m.status = status;
        m
    }

    #[test]
    fn test_new_alive_member_joins() {
        let mut table = MemberTable::new(member("a", 7000, 1, 0));
        let now = Instant::now();

        let b = member("b", 7002, 1, 0);
        assert_eq!(table.merge(b.clone(), now), Some(MemberEvent::Joined(b.clone())));
        assert_eq!(table.merge(b, now), None);
        assert_eq!(table.alive_peers(), vec![SocketAddr::from(([127, 0, 0, 1], 7002))]);
    }

    #[test]
    fn test_local_state_is_ignored() {
        let mut table = MemberTable::new(member("a", 7000, 1, 5));
        let stale = with_status(member("a", 7000, 1, 9), MemberStatus::Left);

        assert_eq!(table.merge(stale, Instant::now()), None);
        assert_eq!(table.local().status, MemberStatus::Alive);
        assert_eq!(table.local().heartbeat, 5);
        assert!(table.alive_peers().is_empty());
    }

    #[test]
    fn test_unknown_left_member_is_recorded_without_event() {
        let mut table = MemberTable::new(member("a", 7000, 1, 0));
        let c = with_status(member("c", 7004, 1, 3), MemberStatus::Left);

        assert_eq!(table.merge(c, Instant::now()), None);
        assert_eq!(table.get("c").unwrap().status, MemberStatus::Left);
        assert!(table.alive_peers().is_empty());
    }

    #[test]
    fn test_leave_wins_at_same_incarnation() {
        let mut table = MemberTable::new(member("a", 7000, 1, 0));
        let now = Instant::now();
        table.merge(member("c", 7004, 1, 10), now);

        let left = with_status(member("c", 7004, 1, 11), MemberStatus::Left);
        assert!(matches!(table.merge(left, now), Some(MemberEvent::Left(m)) if m.name == "c"));

        // A late alive heartbeat does not resurrect it.
        assert_eq!(table.merge(member("c", 7004, 1, 50), now), None);
        assert_eq!(table.get("c").unwrap().status, MemberStatus::Left);
    }

    #[test]
    fn test_heartbeat_refreshes_and_stale_heartbeat_is_ignored() {
        let mut table = MemberTable::new(member("a", 7000, 1, 0));
        let start = Instant::now();
        table.merge(member("b", 7002, 1, 5), start);

        let later = start + Duration::from_secs(2);
        assert_eq!(table.merge(member("b", 7002, 1, 4), later), None);
        assert_eq!(table.get("b").unwrap().heartbeat, 5);

        assert_eq!(table.merge(member("b", 7002, 1, 6), later), None);
        assert_eq!(table.get("b").unwrap().heartbeat, 6);

        // last_seen moved to `later`, so it is not expired yet.
        let events = table.expire(Duration::from_secs(3), start + Duration::from_secs(4));
        assert!(events.is_empty());
    }

    #[test]
    fn test_expire_then_revive() {
        let mut table = MemberTable::new(member("a", 7000, 1, 0));
        let start = Instant::now();
        table.merge(member("b", 7002, 1, 5), start);

        let events = table.expire(Duration::from_secs(3), start + Duration::from_secs(4));
        assert!(matches!(events.as_slice(), [MemberEvent::Failed(m)] if m.name == "b"));
        assert!(table.alive_peers().is_empty());
        assert!(table.gossip_view().iter().all(|m| m.name != "b"));

        // Expiring again does not repeat the event.
        assert!(
            table
                .expire(Duration::from_secs(3), start + Duration::from_secs(10))
                .is_empty()
        );

        // Same heartbeat does not revive; a newer one does.
        let at = start + Duration::from_secs(11);
        assert_eq!(table.merge(member("b", 7002, 1, 5), at), None);
        assert!(matches!(
            table.merge(member("b", 7002, 1, 6), at),
            Some(MemberEvent::Joined(m)) if m.name == "b"
        ));
        assert_eq!(table.get("b").unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn test_higher_incarnation_replaces_state() {
        let mut table = MemberTable::new(member("a", 7000, 1, 0));
        let now = Instant::now();
        table.merge(member("b", 7002, 1, 100), now);
        table.merge(with_status(member("b", 7002, 1, 101), MemberStatus::Left), now);

        // Restarted process, lower heartbeat but newer incarnation.
        let restarted = member("b", 7010, 2, 0);
        assert_eq!(
            table.merge(restarted.clone(), now),
            Some(MemberEvent::Joined(restarted))
        );
        assert_eq!(table.get("b").unwrap().addr.port(), 7010);

        // Anything from the old incarnation is now stale.
        let old = with_status(member("b", 7002, 1, 500), MemberStatus::Left);
        assert_eq!(table.merge(old, now), None);
        assert_eq!(table.get("b").unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn test_local_leave_and_views() {
        let mut table = MemberTable::new(member("b", 7002, 1, 0));
        let now = Instant::now();
        table.merge(member("c", 7004, 1, 0), now);
        table.merge(member("a", 7000, 1, 0), now);
        table.tick();
        table.leave_local();

        assert_eq!(table.local().status, MemberStatus::Left);
        assert_eq!(table.local().heartbeat, 2);

        let names: Vec<String> = table.members().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(table.gossip_view().len(), 3);
        assert_eq!(table.random_peers(1).len(), 1);
        assert_eq!(table.random_peers(5).len(), 2);
        assert_eq!(table.get("a").unwrap().tag("rpc_addr"), Some("127.0.0.1:7001"));
    }
}
