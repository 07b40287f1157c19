//! Automount node tree.
//!
//! Nodes mirror the namespace served to NFS clients. Slots are re-used
//! once freed, so every node carries a generation number; a handle that
//! names a slot with a different generation is stale.

use {
    crate::{mapc::MapId, mntfs::MntfsId},
    bitflags::bitflags,
    std::{
        collections::VecDeque,
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    },
};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AmFlags: u32 {
        /// Never time out
        const NOTIMEOUT = 0x01;
        /// Root of the namespace or a top-level automount point
        const ROOT      = 0x02;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// Per-node operation counters reported through amq.
#[derive(Clone, Debug, Default)]
pub struct AmStats {
    /// Seconds since the epoch when the node was mounted
    pub mounted_at: u64,
    pub getattr: u32,
    pub lookup: u32,
    pub readdir: u32,
    pub readlink: u32,
    pub statfs: u32,
}

#[derive(Debug)]
pub struct AmNode {
    pub name: String,
    pub path: String,
    /// Prefix prepended to child names to form map keys
    pub pref: String,
    /// Map consulted for children of a directory node
    pub map: Option<MapId>,
    pub mf: MntfsId,
    /// Candidates still to try if the current mount fails
    pub alts: VecDeque<MntfsId>,
    /// Target shown to clients when the node is a symlink
    pub link: Option<String>,
    pub flags: AmFlags,
    pub stats: AmStats,
    pub ttl: Instant,
    pub generation: u32,
    parent: Option<NodeId>,
    child: Option<NodeId>,
    osib: Option<NodeId>,
    ysib: Option<NodeId>,
}

impl AmNode {
    pub fn new(name: &str, path: &str, mf: MntfsId, ttl: Instant) -> AmNode {
        AmNode {
            name: name.to_owned(),
            path: path.to_owned(),
            pref: String::new(),
            map: None,
            mf,
            alts: VecDeque::new(),
            link: None,
            flags: AmFlags::empty(),
            stats: AmStats::default(),
            ttl,
            generation: 0,
            parent: None,
            child: None,
            osib: None,
            ysib: None,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn has_children(&self) -> bool {
        self.child.is_some()
    }

    pub fn touch(&mut self, now: Instant, ttl: Duration) {
        self.ttl = now + ttl;
    }

    pub fn mark_mounted(&mut self) {
        self.stats.mounted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }
}

#[derive(Debug, Default)]
pub struct NodeTree {
    slots: Vec<Option<AmNode>>,
    generation: u32,
}

impl NodeTree {
    pub fn new() -> NodeTree {
        NodeTree::default()
    }

    fn alloc(&mut self, node: AmNode) -> NodeId {
        let idx = match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[idx] = Some(node);
        NodeId(idx as u32)
    }

    /// Insert a node with no parent.
    pub fn insert_root(&mut self, mut node: AmNode) -> NodeId {
        self.generation += 1;
        node.generation = self.generation;
        self.alloc(node)
    }

    /// Insert `node` as the youngest child of `parent`.
    pub fn insert(&mut self, parent: NodeId, mut node: AmNode) -> Option<NodeId> {
        let older = self.get(parent)?.child;
        self.generation += 1;
        node.generation = self.generation;
        node.parent = Some(parent);
        node.osib = older;
        let id = self.alloc(node);
        if let Some(o) = older.and_then(|o| self.get_mut(o)) {
            o.ysib = Some(id);
        }
        if let Some(p) = self.get_mut(parent) {
            p.child = Some(id);
        }
        Some(id)
    }

    /// Unlink and return a childless node.
    pub fn remove(&mut self, id: NodeId) -> Option<AmNode> {
        let node = self.get(id)?;
        if node.child.is_some() {
            return None;
        }
        let (parent, osib, ysib) = (node.parent, node.osib, node.ysib);

        if let Some(y) = ysib.and_then(|y| self.get_mut(y)) {
            y.osib = osib;
        } else if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.child = osib;
        }
        if let Some(o) = osib.and_then(|o| self.get_mut(o)) {
            o.ysib = ysib;
        }
        self.slots.get_mut(id.0 as usize)?.take()
    }

    pub fn get(&self, id: NodeId) -> Option<&AmNode> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut AmNode> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    /// The node in slot `id`, provided it is still generation `generation`.
    pub fn get_gen(&self, id: NodeId, generation: u32) -> Option<&AmNode> {
        self.get(id).filter(|n| n.generation == generation)
    }

    /// Children of `id`, youngest first.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut next = self.get(id).and_then(|n| n.child);
        while let Some(c) = next {
            out.push(c);
            next = self.get(c).and_then(|n| n.osib);
        }
        out
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .into_iter()
            .find(|c| self.get(*c).is_some_and(|n| n.name == name))
    }

    /// Node whose path is exactly `path`.
    pub fn find_path(&self, path: &str) -> Option<NodeId> {
        self.iter().find(|(_, n)| n.path == path).map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &AmNode)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i as u32), n)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fserver::FserverRegistry,
        mntfs::{MntfsKey, MntfsRegistry},
        ops::FsType,
        opts::FsOpts,
    };

    fn some_mf() -> MntfsId {
        let mut servers = FserverRegistry::new(Duration::from_secs(30));
        let server = servers.find_local();
        let mut reg = MntfsRegistry::new();
        reg.find(
            MntfsKey {
                fstype: FsType::Link,
                mount: "/",
                info: "/",
                opts: "",
                server,
            },
            "",
            FsOpts::default(),
        )
        .0
    }

    #[test]
    fn siblings_stay_linked_across_removal() {
        let now = Instant::now();
        let mf = some_mf();
        let mut tree = NodeTree::new();
        let root = tree.insert_root(AmNode::new("", "/", mf, now));
        let a = tree.insert(root, AmNode::new("a", "/a", mf, now)).unwrap();
        let b = tree.insert(root, AmNode::new("b", "/b", mf, now)).unwrap();
        let c = tree.insert(root, AmNode::new("c", "/c", mf, now)).unwrap();
        assert_eq!(tree.children(root), vec![c, b, a]);

        assert!(tree.remove(root).is_none());
        assert_eq!(tree.remove(b).unwrap().name, "b");
        assert_eq!(tree.children(root), vec![c, a]);
        assert_eq!(tree.remove(c).unwrap().name, "c");
        assert_eq!(tree.children(root), vec![a]);
        assert_eq!(tree.find_child(root, "a"), Some(a));
        assert_eq!(tree.find_path("/a"), Some(a));
    }

    #[test]
    fn reused_slots_get_new_generation() {
        let now = Instant::now();
        let mf = some_mf();
        let mut tree = NodeTree::new();
        let root = tree.insert_root(AmNode::new("", "/", mf, now));
        let a = tree.insert(root, AmNode::new("a", "/a", mf, now)).unwrap();
        let gen_a = tree.get(a).unwrap().generation;
        tree.remove(a);
        let b = tree.insert(root, AmNode::new("b", "/b", mf, now)).unwrap();
        assert_eq!(a, b);
        assert!(tree.get_gen(b, gen_a).is_none());
        assert_eq!(tree.len(), 2);
    }
}
