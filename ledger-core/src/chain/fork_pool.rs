//! Cache of candidate blocks that are not part of the canonical chain yet.
//!
//! Blocks are kept as a forest in an LRU arena keyed by block hash; parent and
//! child links are stored as hashes. The tree holding the pool root follows the
//! canonical tip. Every other tree hangs off an orphan: a node whose parent is
//! not cached.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::types::{Block, BlockHash};

/// Maximum number of blocks kept in the pool.
pub const DEFAULT_FORK_POOL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct ForkNode {
    block: Block,
    parent: Option<BlockHash>,
    children: Vec<BlockHash>,
}

impl ForkNode {
    fn new(block: Block) -> Self {
        Self {
            block,
            parent: None,
            children: Vec::new(),
        }
    }
}

type Arena = LruCache<BlockHash, ForkNode>;

/// Forest of candidate blocks.
///
/// Lock order is always arena, then orphans, then root.
pub struct ForkPool {
    nodes: Mutex<Arena>,
    orphans: RwLock<HashSet<BlockHash>>,
    root: RwLock<Option<Block>>,
}

impl Default for ForkPool {
    fn default() -> Self {
        Self::new(DEFAULT_FORK_POOL_CAPACITY)
    }
}

impl ForkPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            nodes: Mutex::new(LruCache::new(capacity)),
            orphans: RwLock::new(HashSet::new()),
            root: RwLock::new(None),
        }
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    pub fn num_orphans(&self) -> usize {
        self.orphans.read().len()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.nodes.lock().contains(hash)
    }

    pub fn is_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans.read().contains(hash)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        self.nodes.lock().peek(hash).map(|node| node.block.clone())
    }

    pub fn root_hash(&self) -> Option<BlockHash> {
        self.root.read().as_ref().map(Block::hash)
    }

    pub fn root_block(&self) -> Option<Block> {
        self.root.read().clone()
    }

    /// Whether `block` may enter the pool.
    ///
    /// Accepted when there is no root yet, when the block extends the root, or
    /// when it is more than one block above the root. The last rule is
    /// deliberately loose: it admits blocks regardless of ancestry, and replay
    /// checks the ancestry later.
    pub fn is_block_valid(&self, block: &Block) -> bool {
        Self::is_valid_against(self.root.read().as_ref(), block)
    }

    fn is_valid_against(root: Option<&Block>, block: &Block) -> bool {
        match root {
            None => true,
            Some(root) => {
                block.prev_hash() == root.hash() || block.height() > root.height() + 1
            }
        }
    }

    /// Caches `block` and links it into the forest.
    ///
    /// Silently ignores blocks that are already cached or not valid against
    /// the root. Orphans waiting for this block are attached under it.
    pub fn add_block(&self, block: &Block) {
        let hash = block.hash();
        let mut nodes = self.nodes.lock();
        if nodes.contains(&hash) {
            trace!("Block {} already in fork pool", hash);
            return;
        }
        if !self.is_block_valid(block) {
            debug!("Rejected block {} at height {} from fork pool", hash, block.height());
            return;
        }

        let mut orphans = self.orphans.write();
        if nodes.len() >= nodes.cap().get() {
            if let Some((evicted, node)) = nodes.pop_lru() {
                debug!("Evicted block {} from full fork pool", evicted);
                Self::detach(&mut nodes, &mut orphans, &evicted, node);
            }
        }

        let mut node = ForkNode::new(block.clone());
        let prev_hash = block.prev_hash();
        if let Some(parent) = nodes.peek_mut(&prev_hash) {
            parent.children.push(hash);
            node.parent = Some(prev_hash);
        } else {
            orphans.insert(hash);
            debug!("Added orphan block {} (prev: {})", hash, prev_hash);
        }

        let adopted: Vec<BlockHash> = orphans
            .iter()
            .filter(|orphan| {
                nodes.peek(*orphan).map(|n| n.block.prev_hash() == hash).unwrap_or(false)
            })
            .copied()
            .collect();
        for orphan in adopted {
            orphans.remove(&orphan);
            if let Some(child) = nodes.peek_mut(&orphan) {
                child.parent = Some(hash);
            }
            node.children.push(orphan);
            debug!("Attached orphan {} under {}", orphan, hash);
        }

        nodes.put(hash, node);
    }

    /// Root of the tree holding `block`, or `None` if it is not cached.
    pub fn get_fork_head(&self, block: &Block) -> Option<Block> {
        let nodes = self.nodes.lock();
        let head = Self::tree_root_of(&nodes, &block.hash())?;
        nodes.peek(&head).map(|node| node.block.clone())
    }

    /// Longest chain of cached blocks starting at `hash`, ordered leaf first.
    ///
    /// On equal lengths the earliest-added child wins. Empty if `hash` is not
    /// cached.
    pub fn get_fork(&self, hash: &BlockHash) -> Vec<Block> {
        let nodes = self.nodes.lock();
        Self::longest_path(&nodes, hash)
            .iter()
            .filter_map(|h| nodes.peek(h).map(|node| node.block.clone()))
            .collect()
    }

    /// Moves the pool root to `block`.
    ///
    /// A block that is not cached replaces the old root's tree as a fresh
    /// singleton root. Otherwise every node outside the block's subtree is
    /// dropped. Either way orphans are re-checked against the new root.
    pub fn set_root_block(&self, block: &Block) {
        let hash = block.hash();
        let mut nodes = self.nodes.lock();
        let mut orphans = self.orphans.write();

        if !nodes.contains(&hash) {
            let old_root = self.root.read().as_ref().map(Block::hash);
            if let Some(old_root) = old_root {
                Self::remove_subtree(&mut nodes, &mut orphans, &old_root);
            }
            if nodes.len() >= nodes.cap().get() {
                if let Some((evicted, node)) = nodes.pop_lru() {
                    Self::detach(&mut nodes, &mut orphans, &evicted, node);
                }
            }
            nodes.put(hash, ForkNode::new(block.clone()));
            *self.root.write() = Some(block.clone());
            self.prune_orphans(&mut nodes, &mut orphans);
            info!(
                "Fork pool re-rooted at {} at height {} ({} blocks, {} orphans)",
                hash,
                block.height(),
                nodes.len(),
                orphans.len()
            );
            return;
        }

        let Some(tree_root) = Self::tree_root_of(&nodes, &hash) else {
            return;
        };
        if orphans.remove(&tree_root) {
            let old_root = self.root.read().as_ref().map(Block::hash);
            if let Some(old_tree) = old_root.and_then(|h| Self::tree_root_of(&nodes, &h)) {
                if old_tree != tree_root {
                    Self::remove_subtree(&mut nodes, &mut orphans, &old_tree);
                }
            }
        }

        let parent = nodes.peek(&hash).and_then(|node| node.parent);
        if let Some(parent) = parent {
            if let Some(parent_node) = nodes.peek_mut(&parent) {
                parent_node.children.retain(|c| *c != hash);
            }
            if let Some(node) = nodes.peek_mut(&hash) {
                node.parent = None;
            }
            Self::remove_subtree(&mut nodes, &mut orphans, &tree_root);
        }

        let root_block = nodes.peek(&hash).map(|node| node.block.clone());
        *self.root.write() = root_block;
        nodes.promote(&hash);
        self.prune_orphans(&mut nodes, &mut orphans);

        debug!(
            "Fork pool root set to {} ({} blocks, {} orphans)",
            hash,
            nodes.len(),
            orphans.len()
        );
    }

    /// Attaches orphans that extend the root and drops orphan trees that are
    /// no longer valid against it.
    fn prune_orphans(&self, nodes: &mut Arena, orphans: &mut HashSet<BlockHash>) {
        let root = self.root.read().clone();
        let Some(root) = root else {
            return;
        };
        let root_hash = root.hash();

        let candidates: Vec<BlockHash> = orphans.iter().copied().collect();
        for orphan in candidates {
            let Some(block) = nodes.peek(&orphan).map(|node| node.block.clone()) else {
                orphans.remove(&orphan);
                continue;
            };

            if block.prev_hash() == root_hash && nodes.contains(&root_hash) {
                orphans.remove(&orphan);
                if let Some(node) = nodes.peek_mut(&orphan) {
                    node.parent = Some(root_hash);
                }
                if let Some(root_node) = nodes.peek_mut(&root_hash) {
                    root_node.children.push(orphan);
                }
                continue;
            }

            if !Self::is_valid_against(Some(&root), &block) {
                debug!("Pruning orphan tree {} at height {}", orphan, block.height());
                Self::remove_subtree(nodes, orphans, &orphan);
            }
        }
    }

    /// Removes `hash` and all its descendants.
    pub fn remove_tree(&self, hash: &BlockHash) {
        let mut nodes = self.nodes.lock();
        let mut orphans = self.orphans.write();
        Self::remove_subtree(&mut nodes, &mut orphans, hash);
    }

    /// Evicts every block of a consumed fork.
    pub fn remove_fork(&self, fork: &[Block]) {
        let Some(first) = fork.first() else {
            return;
        };
        let mut nodes = self.nodes.lock();
        let mut orphans = self.orphans.write();
        for block in fork {
            let hash = block.hash();
            if let Some(node) = nodes.pop(&hash) {
                Self::detach(&mut nodes, &mut orphans, &hash, node);
            }
        }
        orphans.remove(&first.hash());
        debug!("Removed fork of {} blocks ending at {}", fork.len(), first.hash());
    }

    /// Blocks at the root of every orphan tree.
    pub fn fork_heads(&self) -> Vec<Block> {
        let nodes = self.nodes.lock();
        let orphans = self.orphans.read();
        orphans.iter().filter_map(|h| nodes.peek(h).map(|node| node.block.clone())).collect()
    }

    /// Counts forks hanging off blocks accepted by `in_chain`.
    ///
    /// Returns the number of leaves across those orphan trees and the height
    /// of the tallest one.
    pub fn num_forks(&self, in_chain: impl Fn(&BlockHash) -> bool) -> (u64, u64) {
        let nodes = self.nodes.lock();
        let orphans = self.orphans.read();
        let mut num_forks = 0u64;
        let mut max_height = 0u64;
        for orphan in orphans.iter() {
            let Some(node) = nodes.peek(orphan) else {
                continue;
            };
            if !in_chain(&node.block.prev_hash()) {
                continue;
            }
            num_forks += Self::count_leaves(&nodes, orphan);
            max_height = max_height.max(Self::longest_path(&nodes, orphan).len() as u64);
        }
        (num_forks, max_height)
    }

    /// Number of nodes on the longest path down from `hash`; 1 for a leaf.
    pub fn tree_height(&self, hash: &BlockHash) -> usize {
        Self::longest_path(&self.nodes.lock(), hash).len()
    }

    pub fn num_leaves(&self, hash: &BlockHash) -> u64 {
        Self::count_leaves(&self.nodes.lock(), hash)
    }

    /// Hashes of the cached children of `hash`, in insertion order.
    pub fn children_of(&self, hash: &BlockHash) -> Vec<BlockHash> {
        let nodes = self.nodes.lock();
        nodes
            .peek(hash)
            .map(|node| node.children.iter().filter(|c| nodes.contains(*c)).copied().collect())
            .unwrap_or_default()
    }

    fn tree_root_of(nodes: &Arena, hash: &BlockHash) -> Option<BlockHash> {
        let mut current = *hash;
        let mut node = nodes.peek(&current)?;
        while let Some(parent) = node.parent {
            match nodes.peek(&parent) {
                Some(parent_node) => {
                    current = parent;
                    node = parent_node;
                }
                None => break,
            }
        }
        Some(current)
    }

    fn longest_path(nodes: &Arena, hash: &BlockHash) -> Vec<BlockHash> {
        let Some(node) = nodes.peek(hash) else {
            return Vec::new();
        };
        let mut best: Vec<BlockHash> = Vec::new();
        for child in &node.children {
            let path = Self::longest_path(nodes, child);
            // strictly longer: on a tie the first child keeps its place
            if path.len() > best.len() {
                best = path;
            }
        }
        best.push(*hash);
        best
    }

    fn count_leaves(nodes: &Arena, hash: &BlockHash) -> u64 {
        let mut leaves = 0;
        let mut stack = vec![*hash];
        while let Some(current) = stack.pop() {
            let Some(node) = nodes.peek(&current) else {
                continue;
            };
            let children: Vec<BlockHash> =
                node.children.iter().filter(|c| nodes.contains(*c)).copied().collect();
            if children.is_empty() {
                leaves += 1;
            }
            stack.extend(children);
        }
        leaves
    }

    /// Drops `hash` and its descendants from the arena and the orphan set,
    /// unlinking it from a cached parent.
    fn remove_subtree(nodes: &mut Arena, orphans: &mut HashSet<BlockHash>, hash: &BlockHash) {
        if let Some(parent) = nodes.peek(hash).and_then(|node| node.parent) {
            if let Some(parent_node) = nodes.peek_mut(&parent) {
                parent_node.children.retain(|c| c != hash);
            }
        }

        let mut removed = 0usize;
        let mut stack = vec![*hash];
        while let Some(current) = stack.pop() {
            orphans.remove(&current);
            if let Some(node) = nodes.pop(&current) {
                stack.extend(node.children);
                removed += 1;
            }
        }
        trace!("Removed tree {} ({} blocks)", hash, removed);
    }

    /// Unlinks a node that already left the arena. Its cached children become
    /// orphans.
    fn detach(nodes: &mut Arena, orphans: &mut HashSet<BlockHash>, hash: &BlockHash, node: ForkNode) {
        orphans.remove(hash);
        if let Some(parent) = node.parent {
            if let Some(parent_node) = nodes.peek_mut(&parent) {
                parent_node.children.retain(|c| c != hash);
            }
        }
        for child in node.children {
            if let Some(child_node) = nodes.peek_mut(&child) {
                child_node.parent = None;
                orphans.insert(child);
            }
        }
    }
}
