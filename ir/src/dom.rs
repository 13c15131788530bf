//! Dominator and post-dominator trees.
//!
//! Both trees use the iterative reverse-postorder intersection algorithm.
//! The post-dominator tree runs it on the reversed CFG, rooted at a virtual
//! exit that fans into every block without successors.
//!
//! Results are read-only snapshots: a pass computes a tree, queries it, and
//! recomputes after any CFG mutation.

use crate::function::Function;
use crate::values::BlockId;
use rustc_hash::FxHashMap;

/// Dominance queries over the forward CFG.
#[derive(Debug)]
pub struct DominatorTree {
    core: DomTreeCore,
}

impl DominatorTree {
    /// Computes the dominator tree of a function.
    pub fn compute(func: &Function) -> Self {
        let graph = Graph::forward(func);
        Self {
            core: DomTreeCore::compute(graph),
        }
    }

    /// Returns true if `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.core.dominates(a, b)
    }

    /// The immediate dominator of `b`, if `b` is reachable and not the root.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.core.idom(b)
    }

    /// Blocks in dominator-tree preorder (parents before children).
    pub fn preorder(&self) -> &[BlockId] {
        &self.core.preorder
    }

    /// Position of a block in [`DominatorTree::preorder`].
    pub fn preorder_index(&self, b: BlockId) -> Option<usize> {
        self.core.pre.get(&b).map(|&n| n as usize)
    }
}

/// Dominance queries over the reversed CFG.
#[derive(Debug)]
pub struct PostDominatorTree {
    core: DomTreeCore,
}

impl PostDominatorTree {
    /// Computes the post-dominator tree of a function.
    pub fn compute(func: &Function) -> Self {
        let graph = Graph::reverse(func);
        Self {
            core: DomTreeCore::compute(graph),
        }
    }

    /// Returns true if `a` post-dominates `b` (reflexively).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.core.dominates(a, b)
    }
}

/// Compact adjacency form of the (possibly reversed) CFG.
struct Graph {
    blocks: Vec<BlockId>,
    /// Predecessor lists in the processed orientation. The virtual root of
    /// a reversed graph, when present, is the last index.
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
    root: usize,
}

impl Graph {
    fn forward(func: &Function) -> Self {
        let blocks: Vec<BlockId> = func.block_ids().collect();
        let index: FxHashMap<BlockId, usize> =
            blocks.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let n = blocks.len();
        let mut preds = vec![Vec::new(); n];
        let mut succs = vec![Vec::new(); n];
        for (i, &b) in blocks.iter().enumerate() {
            for succ in func.successors(b) {
                let j = index[&succ];
                succs[i].push(j);
                preds[j].push(i);
            }
        }
        let root = index[&func.entry_block().expect("function has no blocks")];
        Self {
            blocks,
            preds,
            succs,
            root,
        }
    }

    fn reverse(func: &Function) -> Self {
        let blocks: Vec<BlockId> = func.block_ids().collect();
        let index: FxHashMap<BlockId, usize> =
            blocks.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let n = blocks.len();
        // One extra node: the virtual exit.
        let mut preds = vec![Vec::new(); n + 1];
        let mut succs = vec![Vec::new(); n + 1];
        for (i, &b) in blocks.iter().enumerate() {
            let cfg_succs = func.successors(b);
            if cfg_succs.is_empty() {
                // Reversed edge: virtual exit -> exit block.
                succs[n].push(i);
                preds[i].push(n);
            }
            for succ in cfg_succs {
                let j = index[&succ];
                // Reversed orientation.
                succs[j].push(i);
                preds[i].push(j);
            }
        }
        Self {
            blocks,
            preds,
            succs,
            root: n,
        }
    }

    fn is_virtual(&self, node: usize) -> bool {
        node >= self.blocks.len()
    }
}

/// Shared tree representation with interval-based dominance queries.
#[derive(Debug)]
struct DomTreeCore {
    /// Dominator-tree DFS entry number per block.
    pre: FxHashMap<BlockId, u32>,
    /// Dominator-tree DFS exit number per block.
    post: FxHashMap<BlockId, u32>,
    idoms: FxHashMap<BlockId, BlockId>,
    preorder: Vec<BlockId>,
}

impl DomTreeCore {
    fn compute(graph: Graph) -> Self {
        let n = graph.preds.len();

        // Reverse postorder from the root.
        let mut postorder = Vec::with_capacity(n);
        let mut seen = vec![false; n];
        let mut stack = vec![(graph.root, 0usize)];
        seen[graph.root] = true;
        while let Some(&(node, next)) = stack.last() {
            if next < graph.succs[node].len() {
                stack.last_mut().unwrap().1 += 1;
                let succ = graph.succs[node][next];
                if !seen[succ] {
                    seen[succ] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(node);
                stack.pop();
            }
        }
        let rpo: Vec<usize> = postorder.into_iter().rev().collect();
        let mut rpo_num = vec![usize::MAX; n];
        for (i, &node) in rpo.iter().enumerate() {
            rpo_num[node] = i;
        }

        // Iterative intersection (Cooper-Harvey-Kennedy).
        let mut idom: Vec<Option<usize>> = vec![None; n];
        idom[graph.root] = Some(graph.root);
        let mut changed = true;
        while changed {
            changed = false;
            for &node in rpo.iter().skip(1) {
                let mut new_idom = None;
                for &pred in &graph.preds[node] {
                    if idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(cur) => intersect(&idom, &rpo_num, pred, cur),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom[node] != Some(new_idom) {
                        idom[node] = Some(new_idom);
                        changed = true;
                    }
                }
            }
        }

        // Dominator-tree DFS for interval numbering.
        let mut children = vec![Vec::new(); n];
        for &node in &rpo {
            if node == graph.root {
                continue;
            }
            if let Some(parent) = idom[node] {
                children[parent].push(node);
            }
        }
        let mut pre = FxHashMap::default();
        let mut post = FxHashMap::default();
        let mut preorder = Vec::new();
        let mut counter = 0u32;
        let mut stack = vec![(graph.root, false)];
        while let Some((node, visited)) = stack.pop() {
            if visited {
                if !graph.is_virtual(node) {
                    post.insert(graph.blocks[node], counter);
                }
                counter += 1;
                continue;
            }
            if !graph.is_virtual(node) {
                pre.insert(graph.blocks[node], counter);
                preorder.push(graph.blocks[node]);
            }
            counter += 1;
            stack.push((node, true));
            for &child in children[node].iter().rev() {
                stack.push((child, false));
            }
        }

        let mut idoms = FxHashMap::default();
        for (node, parent) in idom.iter().enumerate() {
            if let Some(parent) = *parent {
                if parent != node && !graph.is_virtual(node) && !graph.is_virtual(parent) {
                    idoms.insert(graph.blocks[node], graph.blocks[parent]);
                }
            }
        }

        Self {
            pre,
            post,
            idoms,
            preorder,
        }
    }

    fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        match (self.pre.get(&a), self.pre.get(&b), self.post.get(&a), self.post.get(&b)) {
            (Some(&pre_a), Some(&pre_b), Some(&post_a), Some(&post_b)) => {
                pre_a <= pre_b && post_b <= post_a
            }
            _ => false,
        }
    }

    fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.idoms.get(&b).copied()
    }
}

fn intersect(idom: &[Option<usize>], rpo_num: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while rpo_num[a] > rpo_num[b] {
            a = idom[a].expect("intersect walked past the root");
        }
        while rpo_num[b] > rpo_num[a] {
            b = idom[b].expect("intersect walked past the root");
        }
    }
    a
}
