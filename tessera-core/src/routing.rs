use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::error::{Result, StoreError};
use crate::id::{GroupId, ObjectId};

/// Transport address of a peer node (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr(String);

impl NodeAddr {
    pub fn new(addr: impl Into<String>) -> NodeAddr {
        NodeAddr(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeAddr {
    fn from(addr: &str) -> NodeAddr {
        NodeAddr(addr.to_string())
    }
}

impl From<String> for NodeAddr {
    fn from(addr: String) -> NodeAddr {
        NodeAddr(addr)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One member of a replication group, placed on the group's ID ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub position: ObjectId,
    pub addr: NodeAddr,
}

impl RouteEntry {
    /// Ring position derived from the address; every peer computes the
    /// same placement without coordination.
    pub fn for_addr(addr: NodeAddr) -> RouteEntry {
        RouteEntry {
            position: ObjectId::transform(addr.as_str().as_bytes()),
            addr,
        }
    }
}

/// The mesh of peers this node knows about, per replication group.
///
/// Updated on peer join/leave, read on every routed request.
#[derive(Default)]
pub struct RouteGraph {
    groups: RwLock<HashMap<GroupId, Vec<RouteEntry>>>,
}

impl RouteGraph {
    pub fn new() -> RouteGraph {
        RouteGraph::default()
    }

    pub fn insert(&self, group: GroupId, entry: RouteEntry) {
        let mut groups = self.groups.write();
        let members = groups.entry(group).or_default();
        members.retain(|member| member.addr != entry.addr);
        members.push(entry);
        members.sort_by(|a, b| a.position.cmp(&b.position));
    }

    /// Drop a peer from every group it participates in.
    pub fn remove_addr(&self, addr: &NodeAddr) {
        let mut groups = self.groups.write();
        for members in groups.values_mut() {
            members.retain(|member| member.addr != *addr);
        }
        groups.retain(|_, members| !members.is_empty());
    }

    /// The replica responsible for `id` in `group`: the member with the
    /// greatest ring position not above the ID, wrapping to the highest
    /// member when the ID precedes them all.
    pub fn primary_for(&self, group: GroupId, id: &ObjectId) -> Result<NodeAddr> {
        let groups = self.groups.read();
        let members = groups.get(&group).filter(|m| !m.is_empty()).ok_or(StoreError::NoRoute)?;

        let member = members
            .iter()
            .rev()
            .find(|member| member.position <= *id)
            .unwrap_or_else(|| members.last().expect("group checked non-empty"));
        Ok(member.addr.clone())
    }

    pub fn members(&self, group: GroupId) -> Vec<NodeAddr> {
        self.groups
            .read()
            .get(&group)
            .map(|members| members.iter().map(|m| m.addr.clone()).collect())
            .unwrap_or_default()
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_LEN;

    #[test]
    fn unknown_or_empty_group_has_no_route() {
        let graph = RouteGraph::new();
        let id = ObjectId::transform(b"anything");
        assert!(matches!(
            graph.primary_for(99, &id),
            Err(StoreError::NoRoute)
        ));

        graph.insert(1, RouteEntry::for_addr("a:1025".into()));
        graph.remove_addr(&"a:1025".into());
        assert!(matches!(graph.primary_for(1, &id), Err(StoreError::NoRoute)));
    }

    #[test]
    fn single_member_takes_the_whole_ring() {
        let graph = RouteGraph::new();
        graph.insert(2, RouteEntry::for_addr("b:1026".into()));

        for key in ["x", "y", "z"] {
            let id = ObjectId::transform(key.as_bytes());
            assert_eq!(graph.primary_for(2, &id).unwrap(), NodeAddr::from("b:1026"));
        }
    }

    #[test]
    fn ring_lookup_picks_floor_member_and_wraps() {
        let graph = RouteGraph::new();
        let mut low = [0u8; ID_LEN];
        let mut high = [0u8; ID_LEN];
        low[0] = 0x40;
        high[0] = 0x80;
        graph.insert(
            1,
            RouteEntry { position: ObjectId(low), addr: "low:1".into() },
        );
        graph.insert(
            1,
            RouteEntry { position: ObjectId(high), addr: "high:1".into() },
        );

        let mut probe = [0u8; ID_LEN];
        probe[0] = 0x50;
        assert_eq!(
            graph.primary_for(1, &ObjectId(probe)).unwrap(),
            NodeAddr::from("low:1")
        );

        probe[0] = 0x90;
        assert_eq!(
            graph.primary_for(1, &ObjectId(probe)).unwrap(),
            NodeAddr::from("high:1")
        );

        // Before every member: wrap to the highest position.
        probe[0] = 0x01;
        assert_eq!(
            graph.primary_for(1, &ObjectId(probe)).unwrap(),
            NodeAddr::from("high:1")
        );
    }

    #[test]
    fn reinsert_replaces_the_previous_entry() {
        let graph = RouteGraph::new();
        graph.insert(1, RouteEntry::for_addr("a:1".into()));
        graph.insert(1, RouteEntry::for_addr("a:1".into()));
        assert_eq!(graph.members(1).len(), 1);
        assert_eq!(graph.group_ids(), vec![1]);
    }
}
