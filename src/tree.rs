//! Arena-allocated red-black tree with order-statistics augmentation.
//!
//! Nodes live in a `Vec` and reference each other by index; index 0 is the
//! shared sentinel standing in for every null leaf. The sentinel is always
//! black and never holds a live piece. Freed slots are recycled through a
//! free list, so node identity is only valid while the node is attached.
//!
//! Every node carries `size_left` / `lf_left`: the total byte length and
//! line-feed count of its left subtree. Rotations and fixups must keep
//! this metadata exact; a missed propagation silently corrupts every
//! subsequent offset and line query.

use crate::buffer::BufferCursor;

pub(crate) type NodeIdx = usize;

/// Reserved arena slot standing in for all null leaves.
pub(crate) const SENTINEL: NodeIdx = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

/// Immutable descriptor of a contiguous text run inside one buffer chunk.
/// Edits never mutate a piece in place; they replace the node's piece with
/// a freshly built one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub buffer_index: usize,
    pub start: BufferCursor,
    pub end: BufferCursor,
    pub length: usize,
    pub line_feed_cnt: usize,
}

impl Piece {
    pub fn new(
        buffer_index: usize,
        start: BufferCursor,
        end: BufferCursor,
        line_feed_cnt: usize,
        length: usize,
    ) -> Self {
        Piece {
            buffer_index,
            start,
            end,
            length,
            line_feed_cnt,
        }
    }

    fn sentinel() -> Self {
        Piece {
            buffer_index: 0,
            start: BufferCursor::default(),
            end: BufferCursor::default(),
            length: 0,
            line_feed_cnt: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub piece: Piece,
    pub color: Color,
    pub parent: NodeIdx,
    pub left: NodeIdx,
    pub right: NodeIdx,
    /// Byte length of the left subtree.
    pub size_left: usize,
    /// Line-feed count of the left subtree.
    pub lf_left: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct RbTree {
    nodes: Vec<TreeNode>,
    free: Vec<NodeIdx>,
    pub root: NodeIdx,
}

impl std::ops::Index<NodeIdx> for RbTree {
    type Output = TreeNode;

    fn index(&self, idx: NodeIdx) -> &TreeNode {
        &self.nodes[idx]
    }
}

impl std::ops::IndexMut<NodeIdx> for RbTree {
    fn index_mut(&mut self, idx: NodeIdx) -> &mut TreeNode {
        &mut self.nodes[idx]
    }
}

impl RbTree {
    pub fn new() -> Self {
        let sentinel = TreeNode {
            piece: Piece::sentinel(),
            color: Color::Black,
            parent: SENTINEL,
            left: SENTINEL,
            right: SENTINEL,
            size_left: 0,
            lf_left: 0,
        };
        RbTree {
            nodes: vec![sentinel],
            free: Vec::new(),
            root: SENTINEL,
        }
    }

    /// Number of live (attached) nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1 - self.free.len()
    }

    fn alloc(&mut self, piece: Piece) -> NodeIdx {
        let node = TreeNode {
            piece,
            color: Color::Red,
            parent: SENTINEL,
            left: SENTINEL,
            right: SENTINEL,
            size_left: 0,
            lf_left: 0,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: NodeIdx) {
        debug_assert_ne!(idx, SENTINEL);
        // Detach so stale references are visibly wrong in debug dumps.
        let node = &mut self.nodes[idx];
        node.parent = SENTINEL;
        node.left = SENTINEL;
        node.right = SENTINEL;
        node.piece = Piece::sentinel();
        self.free.push(idx);
    }

    /// The delete fixup may write the sentinel's parent pointer; undo that
    /// before returning to callers.
    fn reset_sentinel(&mut self) {
        self.nodes[SENTINEL].parent = SENTINEL;
    }

    pub fn leftmost(&self, mut x: NodeIdx) -> NodeIdx {
        while self[x].left != SENTINEL {
            x = self[x].left;
        }
        x
    }

    pub fn rightmost(&self, mut x: NodeIdx) -> NodeIdx {
        while self[x].right != SENTINEL {
            x = self[x].right;
        }
        x
    }

    /// In-order successor, or `SENTINEL` past the last node.
    pub fn next(&self, mut x: NodeIdx) -> NodeIdx {
        if self[x].right != SENTINEL {
            return self.leftmost(self[x].right);
        }
        while self[x].parent != SENTINEL {
            if self[self[x].parent].left == x {
                break;
            }
            x = self[x].parent;
        }
        self[x].parent
    }

    /// In-order predecessor, or `SENTINEL` before the first node.
    pub fn prev(&self, mut x: NodeIdx) -> NodeIdx {
        if self[x].left != SENTINEL {
            return self.rightmost(self[x].left);
        }
        while self[x].parent != SENTINEL {
            if self[self[x].parent].right == x {
                break;
            }
            x = self[x].parent;
        }
        self[x].parent
    }

    /// Total byte length of the subtree rooted at `x`.
    pub fn calculate_size(&self, x: NodeIdx) -> usize {
        if x == SENTINEL {
            return 0;
        }
        self[x].size_left + self[x].piece.length + self.calculate_size(self[x].right)
    }

    /// Total line-feed count of the subtree rooted at `x`.
    pub fn calculate_lf(&self, x: NodeIdx) -> usize {
        if x == SENTINEL {
            return 0;
        }
        self[x].lf_left + self[x].piece.line_feed_cnt + self.calculate_lf(self[x].right)
    }

    /// Document offset at which `x`'s piece begins.
    pub fn offset_of_node(&self, mut x: NodeIdx) -> usize {
        if x == SENTINEL {
            return 0;
        }
        let mut pos = self[x].size_left;
        while x != self.root {
            let parent = self[x].parent;
            if self[parent].right == x {
                pos += self[parent].size_left + self[parent].piece.length;
            }
            x = parent;
        }
        pos
    }

    fn left_rotate(&mut self, x: NodeIdx) {
        let y = self[x].right;

        // y takes over x's position, so x's subtree moves into y's left
        // count.
        self[y].size_left += self[x].size_left + self[x].piece.length;
        self[y].lf_left += self[x].lf_left + self[x].piece.line_feed_cnt;

        let y_left = self[y].left;
        self[x].right = y_left;
        if y_left != SENTINEL {
            self[y_left].parent = x;
        }
        let x_parent = self[x].parent;
        self[y].parent = x_parent;
        if x_parent == SENTINEL {
            self.root = y;
        } else if self[x_parent].left == x {
            self[x_parent].left = y;
        } else {
            self[x_parent].right = y;
        }
        self[y].left = x;
        self[x].parent = y;
    }

    fn right_rotate(&mut self, y: NodeIdx) {
        let x = self[y].left;

        let x_right = self[x].right;
        self[y].left = x_right;
        if x_right != SENTINEL {
            self[x_right].parent = y;
        }
        let y_parent = self[y].parent;
        self[x].parent = y_parent;

        // x's subtree leaves y's left count.
        self[y].size_left -= self[x].size_left + self[x].piece.length;
        self[y].lf_left -= self[x].lf_left + self[x].piece.line_feed_cnt;

        if y_parent == SENTINEL {
            self.root = x;
        } else if self[y_parent].right == y {
            self[y_parent].right = x;
        } else {
            self[y_parent].left = x;
        }
        self[x].right = y;
        self[y].parent = x;
    }

    /// Attach a new node holding `piece` as the in-order predecessor of
    /// `node`, then rebalance. With `node == SENTINEL` the tree must be
    /// empty and the new node becomes the root.
    pub fn insert_left(&mut self, node: NodeIdx, piece: Piece) -> NodeIdx {
        let z = self.alloc(piece);
        if self.root == SENTINEL {
            self.root = z;
            self[z].color = Color::Black;
        } else if self[node].left == SENTINEL {
            self[node].left = z;
            self[z].parent = node;
        } else {
            let prev = self.rightmost(self[node].left);
            self[prev].right = z;
            self[z].parent = prev;
        }
        self.fix_insert(z);
        z
    }

    /// Attach a new node holding `piece` as the in-order successor of
    /// `node`, then rebalance.
    pub fn insert_right(&mut self, node: NodeIdx, piece: Piece) -> NodeIdx {
        let z = self.alloc(piece);
        if self.root == SENTINEL {
            self.root = z;
            self[z].color = Color::Black;
        } else if self[node].right == SENTINEL {
            self[node].right = z;
            self[z].parent = node;
        } else {
            let next = self.leftmost(self[node].right);
            self[next].left = z;
            self[z].parent = next;
        }
        self.fix_insert(z);
        z
    }

    fn fix_insert(&mut self, mut x: NodeIdx) {
        self.recompute_metadata(x);

        while x != self.root && self[self[x].parent].color == Color::Red {
            let parent = self[x].parent;
            let grand = self[parent].parent;
            if parent == self[grand].left {
                let uncle = self[grand].right;
                if self[uncle].color == Color::Red {
                    self[parent].color = Color::Black;
                    self[uncle].color = Color::Black;
                    self[grand].color = Color::Red;
                    x = grand;
                } else {
                    if x == self[parent].right {
                        x = parent;
                        self.left_rotate(x);
                    }
                    let parent = self[x].parent;
                    let grand = self[parent].parent;
                    self[parent].color = Color::Black;
                    self[grand].color = Color::Red;
                    self.right_rotate(grand);
                }
            } else {
                let uncle = self[grand].left;
                if self[uncle].color == Color::Red {
                    self[parent].color = Color::Black;
                    self[uncle].color = Color::Black;
                    self[grand].color = Color::Red;
                    x = grand;
                } else {
                    if x == self[parent].left {
                        x = parent;
                        self.right_rotate(x);
                    }
                    let parent = self[x].parent;
                    let grand = self[parent].parent;
                    self[parent].color = Color::Black;
                    self[grand].color = Color::Red;
                    self.left_rotate(grand);
                }
            }
        }
        let root = self.root;
        self[root].color = Color::Black;
    }

    /// Detach `z`, restore the red-black invariants, and recycle its slot.
    /// The caller is responsible for evicting any cached references first.
    pub fn delete(&mut self, z: NodeIdx) {
        let (x, y);
        if self[z].left == SENTINEL {
            y = z;
            x = self[y].right;
        } else if self[z].right == SENTINEL {
            y = z;
            x = self[y].left;
        } else {
            y = self.leftmost(self[z].right);
            x = self[y].right;
        }

        if y == self.root {
            self.root = x;
            self[x].color = Color::Black;
            self.release(z);
            self.reset_sentinel();
            let root = self.root;
            self[root].parent = SENTINEL;
            return;
        }

        let y_was_red = self[y].color == Color::Red;

        let y_parent = self[y].parent;
        if y == self[y_parent].left {
            self[y_parent].left = x;
        } else {
            self[y_parent].right = x;
        }

        if y == z {
            self[x].parent = y_parent;
            self.recompute_metadata(x);
        } else {
            if self[y].parent == z {
                self[x].parent = y;
            } else {
                self[x].parent = self[y].parent;
            }
            self.recompute_metadata(x);

            // y replaces z in the tree.
            let z_node = self[z].clone();
            self[y].left = z_node.left;
            self[y].right = z_node.right;
            self[y].parent = z_node.parent;
            self[y].color = z_node.color;
            if z == self.root {
                self.root = y;
            } else if z == self[z_node.parent].left {
                self[z_node.parent].left = y;
            } else {
                self[z_node.parent].right = y;
            }
            let y_left = self[y].left;
            if y_left != SENTINEL {
                self[y_left].parent = y;
            }
            let y_right = self[y].right;
            if y_right != SENTINEL {
                self[y_right].parent = y;
            }
            self[y].size_left = z_node.size_left;
            self[y].lf_left = z_node.lf_left;
            self.recompute_metadata(y);
        }

        self.release(z);

        let x_parent = self[x].parent;
        if self[x_parent].left == x {
            let new_size_left = self.calculate_size(x);
            let new_lf_left = self.calculate_lf(x);
            if new_size_left != self[x_parent].size_left || new_lf_left != self[x_parent].lf_left {
                let delta = new_size_left as isize - self[x_parent].size_left as isize;
                let lf_delta = new_lf_left as isize - self[x_parent].lf_left as isize;
                self[x_parent].size_left = new_size_left;
                self[x_parent].lf_left = new_lf_left;
                self.update_metadata(x_parent, delta, lf_delta);
            }
        }
        self.recompute_metadata(x_parent);

        if y_was_red {
            self.reset_sentinel();
            return;
        }

        // Delete fixup: x carries an extra black.
        let mut x = x;
        while x != self.root && self[x].color == Color::Black {
            let parent = self[x].parent;
            if x == self[parent].left {
                let mut w = self[parent].right;
                if self[w].color == Color::Red {
                    self[w].color = Color::Black;
                    self[parent].color = Color::Red;
                    self.left_rotate(parent);
                    w = self[parent].right;
                }
                if self[self[w].left].color == Color::Black
                    && self[self[w].right].color == Color::Black
                {
                    self[w].color = Color::Red;
                    x = parent;
                } else {
                    if self[self[w].right].color == Color::Black {
                        let w_left = self[w].left;
                        self[w_left].color = Color::Black;
                        self[w].color = Color::Red;
                        self.right_rotate(w);
                        w = self[parent].right;
                    }
                    self[w].color = self[parent].color;
                    self[parent].color = Color::Black;
                    let w_right = self[w].right;
                    self[w_right].color = Color::Black;
                    self.left_rotate(parent);
                    x = self.root;
                }
            } else {
                let mut w = self[parent].left;
                if self[w].color == Color::Red {
                    self[w].color = Color::Black;
                    self[parent].color = Color::Red;
                    self.right_rotate(parent);
                    w = self[parent].left;
                }
                if self[self[w].left].color == Color::Black
                    && self[self[w].right].color == Color::Black
                {
                    self[w].color = Color::Red;
                    x = parent;
                } else {
                    if self[self[w].left].color == Color::Black {
                        let w_right = self[w].right;
                        self[w_right].color = Color::Black;
                        self[w].color = Color::Red;
                        self.left_rotate(w);
                        w = self[parent].left;
                    }
                    self[w].color = self[parent].color;
                    self[parent].color = Color::Black;
                    let w_left = self[w].left;
                    self[w_left].color = Color::Black;
                    self.right_rotate(parent);
                    x = self.root;
                }
            }
        }
        self[x].color = Color::Black;
        self.reset_sentinel();
    }

    /// Apply a known byte/line-feed delta from `x` up to the root, adding
    /// it to every ancestor whose left subtree contains `x`.
    pub fn update_metadata(&mut self, mut x: NodeIdx, delta: isize, lf_delta: isize) {
        while x != self.root && x != SENTINEL {
            let parent = self[x].parent;
            if self[parent].left == x {
                self[parent].size_left = (self[parent].size_left as isize + delta) as usize;
                self[parent].lf_left = (self[parent].lf_left as isize + lf_delta) as usize;
            }
            x = parent;
        }
    }

    /// After a structural change at `x`, walk up to the first ancestor
    /// whose left subtree changed, recompute its metadata from scratch,
    /// and push the delta the rest of the way to the root.
    pub fn recompute_metadata(&mut self, mut x: NodeIdx) {
        if x == self.root {
            return;
        }
        while x != self.root && x == self[self[x].parent].right {
            x = self[x].parent;
        }
        if x == self.root {
            return;
        }
        x = self[x].parent;

        let delta = self.calculate_size(self[x].left) as isize - self[x].size_left as isize;
        let lf_delta = self.calculate_lf(self[x].left) as isize - self[x].lf_left as isize;
        self[x].size_left = (self[x].size_left as isize + delta) as usize;
        self[x].lf_left = (self[x].lf_left as isize + lf_delta) as usize;

        if delta == 0 && lf_delta == 0 {
            return;
        }
        self.update_metadata(x, delta, lf_delta);
    }

    /// Verify the structural invariants, returning a description of the
    /// first violation found. Walks the whole tree; test/diagnostic use
    /// only.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self[SENTINEL].color != Color::Black {
            return Err("sentinel is not black".to_string());
        }
        if self.root != SENTINEL && self[self.root].color != Color::Black {
            return Err("root is not black".to_string());
        }
        self.check_subtree(self.root).map(|_| ())
    }

    /// Returns (black_height, subtree_size, subtree_lf).
    fn check_subtree(&self, x: NodeIdx) -> Result<(usize, usize, usize), String> {
        if x == SENTINEL {
            return Ok((0, 0, 0));
        }
        let node = &self[x];
        if node.color == Color::Red {
            if self[node.left].color == Color::Red || self[node.right].color == Color::Red {
                return Err(format!("red node {} has a red child", x));
            }
        }
        let (lh, lsize, llf) = self.check_subtree(node.left)?;
        let (rh, rsize, rlf) = self.check_subtree(node.right)?;
        if lh != rh {
            return Err(format!(
                "black height mismatch at node {}: {} vs {}",
                x, lh, rh
            ));
        }
        if node.size_left != lsize {
            return Err(format!(
                "node {}: size_left {} != left subtree size {}",
                x, node.size_left, lsize
            ));
        }
        if node.lf_left != llf {
            return Err(format!(
                "node {}: lf_left {} != left subtree lf {}",
                x, node.lf_left, llf
            ));
        }
        if node.left != SENTINEL && self[node.left].parent != x {
            return Err(format!("node {}: broken left parent link", x));
        }
        if node.right != SENTINEL && self[node.right].parent != x {
            return Err(format!("node {}: broken right parent link", x));
        }
        let black = if node.color == Color::Black { 1 } else { 0 };
        Ok((
            lh + black,
            lsize + node.piece.length + rsize,
            llf + node.piece.line_feed_cnt + rlf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(len: usize, lf: usize) -> Piece {
        Piece::new(
            1,
            BufferCursor::new(0, 0),
            BufferCursor::new(lf, 0),
            lf,
            len,
        )
    }

    #[test]
    fn test_insert_right_chain_keeps_invariants() {
        let mut tree = RbTree::new();
        let mut last = SENTINEL;
        for i in 0..64 {
            last = tree.insert_right(last, piece(i + 1, i % 3));
            tree.check_invariants().unwrap();
        }
        assert_eq!(tree.len(), 64);
        // Sum of 1..=64
        assert_eq!(tree.calculate_size(tree.root), 64 * 65 / 2);
    }

    #[test]
    fn test_insert_left_chain_keeps_invariants() {
        let mut tree = RbTree::new();
        let mut last = SENTINEL;
        for _ in 0..64 {
            last = tree.insert_left(last, piece(1, 0));
            tree.check_invariants().unwrap();
        }
        assert_eq!(tree.len(), 64);
        assert_eq!(tree.calculate_size(tree.root), 64);
    }

    #[test]
    fn test_delete_all_in_order() {
        let mut tree = RbTree::new();
        let mut last = SENTINEL;
        for i in 0..32 {
            last = tree.insert_right(last, piece(i + 1, 0));
        }
        while tree.root != SENTINEL {
            let first = tree.leftmost(tree.root);
            tree.delete(first);
            tree.check_invariants().unwrap();
        }
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn test_delete_interleaved() {
        let mut tree = RbTree::new();
        let mut last = SENTINEL;
        let mut nodes = Vec::new();
        for i in 0..48 {
            last = tree.insert_right(last, piece(i + 1, i % 2));
            nodes.push(last);
        }
        // Delete every other node, then the rest.
        for &n in nodes.iter().step_by(2) {
            tree.delete(n);
            tree.check_invariants().unwrap();
        }
        for &n in nodes.iter().skip(1).step_by(2) {
            tree.delete(n);
            tree.check_invariants().unwrap();
        }
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn test_offset_of_node() {
        let mut tree = RbTree::new();
        let mut last = SENTINEL;
        let mut nodes = Vec::new();
        for _ in 0..10 {
            last = tree.insert_right(last, piece(7, 0));
            nodes.push(last);
        }
        let mut x = tree.leftmost(tree.root);
        let mut expected = 0;
        while x != SENTINEL {
            assert_eq!(tree.offset_of_node(x), expected);
            expected += 7;
            x = tree.next(x);
        }
    }

    #[test]
    fn test_next_prev_round_trip() {
        let mut tree = RbTree::new();
        let mut last = SENTINEL;
        for i in 0..20 {
            last = tree.insert_right(last, piece(i + 1, 0));
        }
        let mut order = Vec::new();
        let mut x = tree.leftmost(tree.root);
        while x != SENTINEL {
            order.push(x);
            x = tree.next(x);
        }
        assert_eq!(order.len(), 20);
        let mut back = Vec::new();
        let mut x = tree.rightmost(tree.root);
        while x != SENTINEL {
            back.push(x);
            x = tree.prev(x);
        }
        back.reverse();
        assert_eq!(order, back);
    }

    #[test]
    fn test_slot_reuse_after_delete() {
        let mut tree = RbTree::new();
        let a = tree.insert_right(SENTINEL, piece(3, 0));
        let b = tree.insert_right(a, piece(4, 0));
        tree.delete(a);
        let c = tree.insert_right(b, piece(5, 0));
        // Freed slot comes back from the free list.
        assert_eq!(c, a);
        tree.check_invariants().unwrap();
        assert_eq!(tree.calculate_size(tree.root), 9);
    }
}
