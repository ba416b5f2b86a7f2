/*!
A red-black tree used as the ordered index for all time-based and hash-based
lookups in the pool and the storage cache.

Nodes live in an internal arena (a slab with an embedded free list) and are
addressed by [`NodeId`]; callers embed node ids in their own records rather
than intrusive link fields. Keys are unsigned integers with the node colour
packed into the top bit of the key word, leaving 63 usable key bits.

Duplicate keys are supported through a secondary comparator: on an equal key
the comparator orders the values, and insertion of a truly equal item is
refused with a duplicate status.
*/

use core::cmp::Ordering;
use thiserror::Error;

const NIL: u32 = u32::MAX;
const COLOR_RED: u64 = 1 << 63;

/// Usable key space: 63 bits, the top bit of the key word holds the colour.
pub const KEY_MASK: u64 = COLOR_RED - 1;

/// Returned when an insert finds the key (and, under a comparator, the
/// value) already present. The tree is not modified.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("key already present in index")]
pub struct DuplicateKey;

/// Handle to a node stored in the tree arena.
///
/// A `NodeId` stays valid until the node is extracted; using it afterwards
/// is a logic error and panics (an invariant violation, not a recoverable
/// condition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

struct Node<V> {
    key_color: u64,
    parent: u32,
    left: u32,
    right: u32,
    value: V,
}

enum Slot<V> {
    Free { next: u32 },
    Used(Node<V>),
}

pub struct RbTree<V> {
    slots: Vec<Slot<V>>,
    free_head: u32,
    root: u32,
    len: usize,
}

impl<V> Default for RbTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RbTree<V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            root: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// True while `id` refers to a live (not yet extracted) node.
    pub fn is_member(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id.0 as usize), Some(Slot::Used(_)))
    }

    fn node(&self, i: u32) -> &Node<V> {
        match &self.slots[i as usize] {
            Slot::Used(n) => n,
            Slot::Free { .. } => panic!("rbtree: access to freed node"),
        }
    }

    fn node_mut(&mut self, i: u32) -> &mut Node<V> {
        match &mut self.slots[i as usize] {
            Slot::Used(n) => n,
            Slot::Free { .. } => panic!("rbtree: access to freed node"),
        }
    }

    /// Key stored at `id`.
    pub fn key_of(&self, id: NodeId) -> u64 {
        self.node(id.0).key_color & KEY_MASK
    }

    pub fn get(&self, id: NodeId) -> &V {
        &self.node(id.0).value
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut V {
        &mut self.node_mut(id.0).value
    }

    #[inline]
    fn key(&self, i: u32) -> u64 {
        self.node(i).key_color & KEY_MASK
    }

    #[inline]
    fn is_red(&self, i: u32) -> bool {
        i != NIL && self.node(i).key_color & COLOR_RED != 0
    }

    fn set_red(&mut self, i: u32, red: bool) {
        let n = self.node_mut(i);
        if red {
            n.key_color |= COLOR_RED;
        } else {
            n.key_color &= !COLOR_RED;
        }
    }

    fn alloc_node(&mut self, key: u64, value: V) -> u32 {
        let node = Node {
            key_color: (key & KEY_MASK) | COLOR_RED,
            parent: NIL,
            left: NIL,
            right: NIL,
            value,
        };
        if self.free_head != NIL {
            let i = self.free_head;
            match self.slots[i as usize] {
                Slot::Free { next } => self.free_head = next,
                Slot::Used(_) => unreachable!(),
            }
            self.slots[i as usize] = Slot::Used(node);
            i
        } else {
            self.slots.push(Slot::Used(node));
            (self.slots.len() - 1) as u32
        }
    }

    fn free_node(&mut self, i: u32) -> V {
        let slot = core::mem::replace(
            &mut self.slots[i as usize],
            Slot::Free {
                next: self.free_head,
            },
        );
        self.free_head = i;
        match slot {
            Slot::Used(n) => n.value,
            Slot::Free { .. } => panic!("rbtree: double extract"),
        }
    }

    fn rotate_left(&mut self, x: u32) {
        let y = self.node(x).right;
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if y_left != NIL {
            self.node_mut(y_left).parent = x;
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.node(xp).left == x {
            self.node_mut(xp).left = y;
        } else {
            self.node_mut(xp).right = y;
        }
        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.node(x).left;
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if y_right != NIL {
            self.node_mut(y_right).parent = x;
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.node(xp).right == x {
            self.node_mut(xp).right = y;
        } else {
            self.node_mut(xp).left = y;
        }
        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;
    }

    /// Inserts under the unique-key rule: an equal key is refused.
    pub fn insert_unique(&mut self, key: u64, value: V) -> Result<NodeId, (DuplicateKey, V)> {
        self.insert_impl(key, value, None)
    }

    /// Inserts allowing duplicate keys: on an equal key the comparator
    /// orders the two values (`Less` places the new value to the left). A
    /// comparator result of `Equal` refuses the insert.
    pub fn insert_with(
        &mut self,
        key: u64,
        value: V,
        cmp: &dyn Fn(&V, &V) -> Ordering,
    ) -> Result<NodeId, (DuplicateKey, V)> {
        self.insert_impl(key, value, Some(cmp))
    }

    fn insert_impl(
        &mut self,
        key: u64,
        value: V,
        cmp: Option<&dyn Fn(&V, &V) -> Ordering>,
    ) -> Result<NodeId, (DuplicateKey, V)> {
        let key = key & KEY_MASK;
        let mut parent = NIL;
        let mut pos = self.root;
        let mut go_left = false;
        while pos != NIL {
            parent = pos;
            let ord = match key.cmp(&self.key(pos)) {
                Ordering::Equal => match cmp {
                    None => return Err((DuplicateKey, value)),
                    Some(f) => match f(&value, &self.node(pos).value) {
                        Ordering::Equal => return Err((DuplicateKey, value)),
                        o => o,
                    },
                },
                o => o,
            };
            go_left = ord == Ordering::Less;
            pos = if go_left {
                self.node(pos).left
            } else {
                self.node(pos).right
            };
        }

        let z = self.alloc_node(key, value);
        self.node_mut(z).parent = parent;
        if parent == NIL {
            self.root = z;
        } else if go_left {
            self.node_mut(parent).left = z;
        } else {
            self.node_mut(parent).right = z;
        }
        self.len += 1;
        self.insert_fixup(z);
        Ok(NodeId(z))
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.is_red(self.node(z).parent) {
            let zp = self.node(z).parent;
            let zpp = self.node(zp).parent;
            if zp == self.node(zpp).left {
                let y = self.node(zpp).right;
                if self.is_red(y) {
                    self.set_red(zp, false);
                    self.set_red(y, false);
                    self.set_red(zpp, true);
                    z = zpp;
                } else {
                    if z == self.node(zp).right {
                        z = zp;
                        self.rotate_left(z);
                    }
                    let zp = self.node(z).parent;
                    let zpp = self.node(zp).parent;
                    self.set_red(zp, false);
                    self.set_red(zpp, true);
                    self.rotate_right(zpp);
                }
            } else {
                let y = self.node(zpp).left;
                if self.is_red(y) {
                    self.set_red(zp, false);
                    self.set_red(y, false);
                    self.set_red(zpp, true);
                    z = zpp;
                } else {
                    if z == self.node(zp).left {
                        z = zp;
                        self.rotate_right(z);
                    }
                    let zp = self.node(z).parent;
                    let zpp = self.node(zp).parent;
                    self.set_red(zp, false);
                    self.set_red(zpp, true);
                    self.rotate_left(zpp);
                }
            }
        }
        let root = self.root;
        self.set_red(root, false);
    }

    fn transplant(&mut self, u: u32, v: u32) {
        let up = self.node(u).parent;
        if up == NIL {
            self.root = v;
        } else if self.node(up).left == u {
            self.node_mut(up).left = v;
        } else {
            self.node_mut(up).right = v;
        }
        if v != NIL {
            self.node_mut(v).parent = up;
        }
    }

    fn subtree_min(&self, mut i: u32) -> u32 {
        while self.node(i).left != NIL {
            i = self.node(i).left;
        }
        i
    }

    /// Removes the node and returns its value. The tree is rebalanced to
    /// preserve the red-black invariants.
    pub fn extract(&mut self, id: NodeId) -> V {
        let z = id.0;
        let y_was_black;
        let x;
        let x_parent;

        if self.node(z).left == NIL {
            x = self.node(z).right;
            x_parent = self.node(z).parent;
            y_was_black = !self.is_red(z);
            self.transplant(z, x);
        } else if self.node(z).right == NIL {
            x = self.node(z).left;
            x_parent = self.node(z).parent;
            y_was_black = !self.is_red(z);
            self.transplant(z, x);
        } else {
            let y = self.subtree_min(self.node(z).right);
            y_was_black = !self.is_red(y);
            x = self.node(y).right;
            if self.node(y).parent == z {
                x_parent = y;
            } else {
                x_parent = self.node(y).parent;
                self.transplant(y, x);
                let zr = self.node(z).right;
                self.node_mut(y).right = zr;
                self.node_mut(zr).parent = y;
            }
            self.transplant(z, y);
            let zl = self.node(z).left;
            self.node_mut(y).left = zl;
            self.node_mut(zl).parent = y;
            let z_red = self.is_red(z);
            self.set_red(y, z_red);
        }

        if y_was_black {
            self.extract_fixup(x, x_parent);
        }

        self.len -= 1;
        self.free_node(z)
    }

    fn extract_fixup(&mut self, mut x: u32, mut x_parent: u32) {
        while x != self.root && !self.is_red(x) {
            if x_parent == NIL {
                break;
            }
            if x == self.node(x_parent).left {
                let mut w = self.node(x_parent).right;
                if self.is_red(w) {
                    self.set_red(w, false);
                    self.set_red(x_parent, true);
                    self.rotate_left(x_parent);
                    w = self.node(x_parent).right;
                }
                if !self.is_red(self.node(w).left) && !self.is_red(self.node(w).right) {
                    self.set_red(w, true);
                    x = x_parent;
                    x_parent = self.node(x).parent;
                } else {
                    if !self.is_red(self.node(w).right) {
                        let wl = self.node(w).left;
                        self.set_red(wl, false);
                        self.set_red(w, true);
                        self.rotate_right(w);
                        w = self.node(x_parent).right;
                    }
                    let parent_red = self.is_red(x_parent);
                    self.set_red(w, parent_red);
                    self.set_red(x_parent, false);
                    let wr = self.node(w).right;
                    if wr != NIL {
                        self.set_red(wr, false);
                    }
                    self.rotate_left(x_parent);
                    x = self.root;
                    x_parent = NIL;
                }
            } else {
                let mut w = self.node(x_parent).left;
                if self.is_red(w) {
                    self.set_red(w, false);
                    self.set_red(x_parent, true);
                    self.rotate_right(x_parent);
                    w = self.node(x_parent).left;
                }
                if !self.is_red(self.node(w).left) && !self.is_red(self.node(w).right) {
                    self.set_red(w, true);
                    x = x_parent;
                    x_parent = self.node(x).parent;
                } else {
                    if !self.is_red(self.node(w).left) {
                        let wr = self.node(w).right;
                        self.set_red(wr, false);
                        self.set_red(w, true);
                        self.rotate_left(w);
                        w = self.node(x_parent).left;
                    }
                    let parent_red = self.is_red(x_parent);
                    self.set_red(w, parent_red);
                    self.set_red(x_parent, false);
                    let wl = self.node(w).left;
                    if wl != NIL {
                        self.set_red(wl, false);
                    }
                    self.rotate_right(x_parent);
                    x = self.root;
                    x_parent = NIL;
                }
            }
        }
        if x != NIL {
            self.set_red(x, false);
        }
    }

    /// Looks up a node by key under the unique-key rule.
    pub fn search_unique(&self, key: u64) -> Option<NodeId> {
        let key = key & KEY_MASK;
        let mut pos = self.root;
        while pos != NIL {
            match key.cmp(&self.key(pos)) {
                Ordering::Less => pos = self.node(pos).left,
                Ordering::Greater => pos = self.node(pos).right,
                Ordering::Equal => return Some(NodeId(pos)),
            }
        }
        None
    }

    /// Looks up a node by key and comparator; `cmp` returns the ordering of
    /// the target relative to the candidate value.
    pub fn search_with(&self, key: u64, cmp: &dyn Fn(&V) -> Ordering) -> Option<NodeId> {
        let key = key & KEY_MASK;
        let mut pos = self.root;
        while pos != NIL {
            let ord = match key.cmp(&self.key(pos)) {
                Ordering::Equal => cmp(&self.node(pos).value),
                o => o,
            };
            match ord {
                Ordering::Less => pos = self.node(pos).left,
                Ordering::Greater => pos = self.node(pos).right,
                Ordering::Equal => return Some(NodeId(pos)),
            }
        }
        None
    }

    /// Positions on the smallest node whose key is `>= key`.
    pub fn iter_min_ge(&self, key: u64) -> Option<NodeId> {
        let key = key & KEY_MASK;
        let mut pos = self.root;
        let mut best = NIL;
        while pos != NIL {
            if self.key(pos) >= key {
                best = pos;
                pos = self.node(pos).left;
            } else {
                pos = self.node(pos).right;
            }
        }
        (best != NIL).then_some(NodeId(best))
    }

    /// Positions on the largest node whose key is `<= key`.
    pub fn iter_max_le(&self, key: u64) -> Option<NodeId> {
        let key = key & KEY_MASK;
        let mut pos = self.root;
        let mut best = NIL;
        while pos != NIL {
            if self.key(pos) <= key {
                best = pos;
                pos = self.node(pos).right;
            } else {
                pos = self.node(pos).left;
            }
        }
        (best != NIL).then_some(NodeId(best))
    }

    /// In-order successor.
    pub fn iter_next(&self, id: NodeId) -> Option<NodeId> {
        let mut i = id.0;
        if self.node(i).right != NIL {
            return Some(NodeId(self.subtree_min(self.node(i).right)));
        }
        let mut p = self.node(i).parent;
        while p != NIL && self.node(p).right == i {
            i = p;
            p = self.node(p).parent;
        }
        (p != NIL).then_some(NodeId(p))
    }

    /// In-order predecessor.
    pub fn iter_prev(&self, id: NodeId) -> Option<NodeId> {
        let mut i = id.0;
        if self.node(i).left != NIL {
            let mut m = self.node(i).left;
            while self.node(m).right != NIL {
                m = self.node(m).right;
            }
            return Some(NodeId(m));
        }
        let mut p = self.node(i).parent;
        while p != NIL && self.node(p).left == i {
            i = p;
            p = self.node(p).parent;
        }
        (p != NIL).then_some(NodeId(p))
    }

    /// Black node count along the leftmost root-to-leaf path, not counting
    /// the null leaves. Exposed for invariant checking.
    pub fn black_height(&self) -> usize {
        let mut count = 0;
        let mut pos = self.root;
        while pos != NIL {
            if !self.is_red(pos) {
                count += 1;
            }
            pos = self.node(pos).left;
        }
        count
    }
}
