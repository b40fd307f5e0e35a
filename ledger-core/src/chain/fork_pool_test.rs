//! Tests for the fork pool

#[cfg(test)]
mod tests {
    use super::super::fork_pool::*;
    use crate::test_utils::{block_with_hash, deserialize_pool, label_hash};
    use crate::types::{Block, BlockHash};

    const MATRIX: &str = "0^1, 1#2, 1#3, 3#4, 4#5, 4#6, 4#7, 2#8, 2#9, 8#10, 3^11, 11#12, 11#13, 13#14, 2^15, 15#16, 4^17";

    fn hashes(blocks: &[Block]) -> Vec<BlockHash> {
        blocks.iter().map(Block::hash).collect()
    }

    fn labels(names: &[&str]) -> Vec<BlockHash> {
        names.iter().map(|n| label_hash(n)).collect()
    }

    #[test]
    fn test_matrix_shape() {
        let (pool, _) = deserialize_pool(MATRIX);
        assert_eq!(pool.len(), 17);
        assert_eq!(pool.num_orphans(), 3);
        assert!(pool.is_orphan(&label_hash("11")));
        assert!(pool.is_orphan(&label_hash("15")));
        assert!(pool.is_orphan(&label_hash("17")));
        assert_eq!(pool.root_hash(), Some(label_hash("1")));
        assert_eq!(pool.children_of(&label_hash("1")), labels(&["2", "3"]));
    }

    #[test]
    fn test_remove_tree() {
        for (label, remaining) in [("3", 12), ("13", 15), ("15", 15)] {
            let (pool, _) = deserialize_pool(MATRIX);
            pool.remove_tree(&label_hash(label));
            assert_eq!(pool.len(), remaining, "removing subtree {}", label);
            assert!(!pool.contains(&label_hash(label)));
        }
    }

    #[test]
    fn test_removing_orphan_tree_drops_orphan_entry() {
        let (pool, _) = deserialize_pool(MATRIX);
        pool.remove_tree(&label_hash("15"));
        assert!(!pool.is_orphan(&label_hash("15")));
        assert_eq!(pool.num_orphans(), 2);
    }

    #[test]
    fn test_set_root_block() {
        let cases = [("3", 10, 2), ("4", 5, 1), ("10", 1, 0), ("11", 4, 0), ("13", 2, 0)];
        for (label, nodes, orphans) in cases {
            let (pool, blocks) = deserialize_pool(MATRIX);
            pool.set_root_block(&blocks[label]);
            assert_eq!(pool.len(), nodes, "re-root at {}", label);
            assert_eq!(pool.num_orphans(), orphans, "re-root at {}", label);
            assert_eq!(pool.root_hash(), Some(label_hash(label)));
            assert!(!pool.is_orphan(&label_hash(label)));
        }
    }

    #[test]
    fn test_set_root_keeps_valid_orphans() {
        let (pool, blocks) = deserialize_pool(MATRIX);
        pool.set_root_block(&blocks["4"]);
        assert!(pool.is_orphan(&label_hash("17")));
        assert!(!pool.contains(&label_hash("11")));
        assert!(!pool.contains(&label_hash("1")));
        assert_eq!(pool.children_of(&label_hash("4")), labels(&["5", "6", "7"]));
    }

    #[test]
    fn test_set_root_to_unknown_block_resets_pool() {
        let (pool, _) = deserialize_pool(MATRIX);
        let outsider = block_with_hash("outsider", None, 7);
        pool.set_root_block(&outsider);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.num_orphans(), 0);
        assert_eq!(pool.root_hash(), Some(outsider.hash()));
    }

    #[test]
    fn test_set_root_to_unknown_block_keeps_valid_orphans() {
        let (pool, _) = deserialize_pool(MATRIX);
        let outsider = block_with_hash("outsider", None, 1);
        pool.set_root_block(&outsider);

        // the old root's tree is gone, orphans above height 2 stay
        assert!(!pool.contains(&label_hash("1")));
        assert!(!pool.contains(&label_hash("10")));
        assert!(!pool.contains(&label_hash("15")));
        assert!(pool.is_orphan(&label_hash("11")));
        assert!(pool.is_orphan(&label_hash("17")));
        assert_eq!(pool.num_orphans(), 2);
        assert_eq!(pool.len(), 6);
        assert_eq!(pool.root_hash(), Some(outsider.hash()));
    }

    #[test]
    fn test_set_root_drops_ancestors() {
        let (pool, blocks) = deserialize_pool("1, 1#2");
        // child of a block the pool does not know yet
        let orphan = block_with_hash("4", Some("3"), 3);
        pool.add_block(&orphan);
        assert!(pool.is_orphan(&orphan.hash()));

        let new_root = block_with_hash("3", Some("2"), 2);
        pool.add_block(&new_root);
        assert!(!pool.is_orphan(&orphan.hash()));
        pool.set_root_block(&new_root);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.children_of(&new_root.hash()), vec![orphan.hash()]);
        assert!(!pool.contains(&blocks["1"].hash()));
    }

    #[test]
    fn test_pool_without_root_accepts_anything() {
        let pool = ForkPool::default();
        let block = block_with_hash("x", Some("nowhere"), 42);
        assert!(pool.is_block_valid(&block));
        pool.add_block(&block);
        assert!(pool.contains(&block.hash()));
        assert!(pool.is_orphan(&block.hash()));
    }

    #[test]
    fn test_block_extending_root_is_valid_at_any_height() {
        let (pool, _) = deserialize_pool("5^root");
        for height in [0, 1, 6, 100] {
            let block = block_with_hash("child", Some("root"), height);
            assert!(pool.is_block_valid(&block), "height {}", height);
        }
    }

    #[test]
    fn test_loose_validity_accepts_unrelated_high_blocks() {
        let (pool, _) = deserialize_pool("5^root");
        // not a descendant of the root, admitted anyway for being high enough
        assert!(pool.is_block_valid(&block_with_hash("far", Some("elsewhere"), 7)));
        assert!(!pool.is_block_valid(&block_with_hash("near", Some("elsewhere"), 6)));
        assert!(!pool.is_block_valid(&block_with_hash("low", Some("elsewhere"), 3)));

        pool.add_block(&block_with_hash("low", Some("elsewhere"), 3));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_add_block_is_idempotent() {
        let (pool, blocks) = deserialize_pool("1, 1#2");
        pool.add_block(&blocks["2"]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.children_of(&label_hash("1")), labels(&["2"]));
    }

    #[test]
    fn test_add_block_adopts_orphans() {
        let (pool, _) = deserialize_pool("1");
        let grandchild = block_with_hash("3", Some("2"), 2);
        let sibling = block_with_hash("3b", Some("2"), 2);
        pool.add_block(&grandchild);
        pool.add_block(&sibling);
        assert_eq!(pool.num_orphans(), 2);

        let child = block_with_hash("2", Some("1"), 1);
        pool.add_block(&child);
        assert_eq!(pool.num_orphans(), 0);
        assert_eq!(pool.children_of(&child.hash()).len(), 2);
        assert_eq!(pool.get_fork_head(&grandchild).map(|b| b.hash()), Some(label_hash("1")));
    }

    #[test]
    fn test_get_fork_head() {
        let (pool, blocks) = deserialize_pool(MATRIX);
        let head_of = |label: &str| pool.get_fork_head(&blocks[label]).map(|b| b.hash());
        assert_eq!(head_of("7"), Some(label_hash("1")));
        assert_eq!(head_of("14"), Some(label_hash("11")));
        assert_eq!(head_of("16"), Some(label_hash("15")));
        assert_eq!(head_of("17"), Some(label_hash("17")));
        assert_eq!(pool.get_fork_head(&block_with_hash("unknown", None, 9)), None);
    }

    #[test]
    fn test_get_fork_longest_path() {
        let cases: [(&str, &[&str]); 3] = [
            ("1, 1#2, 1#3", &["2", "1"]),
            ("1,1#2,1#3,2#4,2#5,3#6,3#7,7#8", &["8", "7", "3", "1"]),
            (
                "1, 1#2, 1#3, 1#4, 4#5, 4#6, 3#7, 2#8, 8#9, 9#10, 10#11",
                &["11", "10", "9", "8", "2", "1"],
            ),
        ];
        for (notation, expected) in cases {
            let (pool, _) = deserialize_pool(notation);
            assert_eq!(hashes(&pool.get_fork(&label_hash("1"))), labels(expected), "{}", notation);
        }
    }

    #[test]
    fn test_get_fork_tie_goes_to_first_child() {
        // equal-length branches: the earlier child wins, even though a later
        // branch could carry more work
        let (pool, _) = deserialize_pool("1, 1#2, 1#3, 2#4, 3#5");
        assert_eq!(hashes(&pool.get_fork(&label_hash("1"))), labels(&["4", "2", "1"]));
    }

    #[test]
    fn test_get_fork_unknown_hash_is_empty() {
        let (pool, _) = deserialize_pool("1, 1#2");
        assert!(pool.get_fork(&label_hash("missing")).is_empty());
    }

    #[test]
    fn test_tree_metrics() {
        let (pool, _) = deserialize_pool(MATRIX);
        assert_eq!(pool.tree_height(&label_hash("1")), 4);
        assert_eq!(pool.tree_height(&label_hash("17")), 1);
        assert_eq!(pool.num_leaves(&label_hash("1")), 5);
        assert_eq!(pool.num_leaves(&label_hash("11")), 2);
    }

    #[test]
    fn test_fork_heads_and_num_forks() {
        let (pool, _) = deserialize_pool(MATRIX);
        let mut heads = hashes(&pool.fork_heads());
        heads.sort();
        let mut expected = labels(&["11", "15", "17"]);
        expected.sort();
        assert_eq!(heads, expected);

        // orphans built by the notation have a zero parent
        assert_eq!(pool.num_forks(|hash| hash.is_zero()), (4, 3));
        assert_eq!(pool.num_forks(|_| false), (0, 0));
    }

    #[test]
    fn test_remove_fork() {
        let (pool, blocks) = deserialize_pool(MATRIX);
        let fork = pool.get_fork(&label_hash("11"));
        assert_eq!(hashes(&fork), labels(&["14", "13", "11"]));

        pool.remove_fork(&fork);
        assert_eq!(pool.len(), 14);
        assert!(!pool.is_orphan(&label_hash("11")));
        // the sibling left behind is now an orphan of its own
        assert!(pool.is_orphan(&label_hash("12")));
        assert_eq!(pool.get_fork_head(&blocks["12"]).map(|b| b.hash()), Some(label_hash("12")));

        pool.remove_fork(&[]);
        assert_eq!(pool.len(), 14);
    }

    #[test]
    fn test_eviction_promotes_children_to_orphans() {
        let pool = ForkPool::new(3);
        let a = block_with_hash("a", None, 0);
        let b = block_with_hash("b", Some("a"), 1);
        let c = block_with_hash("c", Some("b"), 2);
        let d = block_with_hash("d", Some("c"), 3);
        pool.set_root_block(&a);
        pool.add_block(&b);
        pool.add_block(&c);
        pool.add_block(&d);

        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&a.hash()));
        assert!(pool.is_orphan(&b.hash()));
        assert_eq!(pool.get_fork_head(&d).map(|h| h.hash()), Some(b.hash()));
        assert_eq!(hashes(&pool.get_fork(&b.hash())), vec![d.hash(), c.hash(), b.hash()]);
    }
}
