//! Message dispatch registry.
//!
//! # Overview
//!
//! Listeners subscribe to exact [`Selector`] values; dispatch of an
//! incoming message derives the message's own selector and looks it up.
//! The registry is a height-balanced binary tree ordered by a scalar key
//! mixed from the selector fields, with full selector comparison breaking
//! key collisions; lookup, insert and removal are all `O(log n)`.
//!
//! # Key Components
//!
//! - [`Listener`]: a selector paired with a boxed callback.
//! - [`ListenerId`]: stable handle for deregistration, valid until the
//!   listener is removed or the connection is dropped.
//! - [`ListenerTree`]: the balanced tree, arena-backed; nodes live in a
//!   slot vector and reference each other by index, with a free list
//!   reusing vacated slots.
//!
//! Callbacks run with the connection lock released, so a callback may
//! itself register or remove listeners. The node's handler is taken out
//! of the tree for the duration of the call and restored afterwards; if
//! the callback removed its own registration in the meantime, the restore
//! finds the slot gone and drops the handler.

use crate::connection::Connection;
use crate::event::{Detail, Msg, Selector, WidgetId};

pub type Handler = Box<dyn FnMut(&Connection, &Msg) + Send>;

pub struct Listener {
    pub selector: Selector,
    pub handler: Handler,
}

impl Listener {
    pub fn new(selector: Selector, handler: Handler) -> Self {
        Self { selector, handler }
    }

    pub fn key(
        widget: WidgetId,
        code: u16,
        shift: u16,
        handler: Handler,
    ) -> Self {
        Self::new(
            Selector {
                mtype: crate::event::msg_type::KEY,
                widget,
                code,
                detail: Detail::Shift(shift),
            },
            handler,
        )
    }

    pub fn mouse(widget: WidgetId, code: u16, shift: u16, handler: Handler) -> Self {
        Self::new(
            Selector {
                mtype: crate::event::msg_type::MOUSE,
                widget,
                code,
                detail: Detail::Shift(shift),
            },
            handler,
        )
    }

    pub fn gadget(widget: WidgetId, code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::GADGET, widget, code, handler)
    }

    pub fn menu_row(widget: WidgetId, code: u16, menu: u32, handler: Handler) -> Self {
        Self::new(
            Selector {
                mtype: crate::event::msg_type::MENU_ROW,
                widget,
                code,
                detail: Detail::Menu(menu),
            },
            handler,
        )
    }

    pub fn widget_change(widget: WidgetId, code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::WIDGET_CHANGE, widget, code, handler)
    }

    pub fn selection(widget: WidgetId, code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::SELECTION, widget, code, handler)
    }

    pub fn selection_notify(widget: WidgetId, code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::SELECTION_NOTIFY, widget, code, handler)
    }

    pub fn selection_request(widget: WidgetId, code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::SELECTION_REQUEST, widget, code, handler)
    }

    pub fn control(code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::CONTROL, crate::event::NO_WIDGET, code, handler)
    }

    pub fn client(widget: WidgetId, code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::CLIENT, widget, code, handler)
    }

    pub fn display(code: u16, handler: Handler) -> Self {
        Self::plain(crate::event::msg_type::DISPLAY, crate::event::NO_WIDGET, code, handler)
    }

    fn plain(mtype: u32, widget: WidgetId, code: u16, handler: Handler) -> Self {
        Self::new(
            Selector {
                mtype,
                widget,
                code,
                detail: Detail::None,
            },
            handler,
        )
    }
}

/// Handle returned by registration; pass it back to deregister. The
/// generation tag keeps a stale handle from touching a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    slot: u32,
    r#gen: u32,
}

struct Node {
    key: u32,
    selector: Selector,
    handler: Option<Handler>,
    left: Option<u32>,
    right: Option<u32>,
    height: u8,
}

#[derive(Default)]
pub struct ListenerTree {
    nodes: Vec<Option<Node>>,
    gens: Vec<u32>,
    free: Vec<u32>,
    root: Option<u32>,
}

impl ListenerTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn node(&self, idx: u32) -> &Node {
        self.nodes[idx as usize]
            .as_ref()
            .unwrap_or_else(|| unreachable!("dangling tree link"))
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node {
        self.nodes[idx as usize]
            .as_mut()
            .unwrap_or_else(|| unreachable!("dangling tree link"))
    }

    fn height(&self, idx: Option<u32>) -> u8 {
        idx.map_or(0, |i| self.node(i).height)
    }

    fn update_height(&mut self, idx: u32) {
        let h = 1 + self.height(self.node(idx).left).max(self.height(self.node(idx).right));
        self.node_mut(idx).height = h;
    }

    fn balance_factor(&self, idx: u32) -> i8 {
        let n = self.node(idx);
        self.height(n.left) as i8 - self.height(n.right) as i8
    }

    fn rotate_right(&mut self, idx: u32) -> u32 {
        let Some(left) = self.node(idx).left else {
            return idx;
        };
        let moved = self.node(left).right;
        self.node_mut(idx).left = moved;
        self.node_mut(left).right = Some(idx);
        self.update_height(idx);
        self.update_height(left);
        left
    }

    fn rotate_left(&mut self, idx: u32) -> u32 {
        let Some(right) = self.node(idx).right else {
            return idx;
        };
        let moved = self.node(right).left;
        self.node_mut(idx).right = moved;
        self.node_mut(right).left = Some(idx);
        self.update_height(idx);
        self.update_height(right);
        right
    }

    fn rebalance(&mut self, idx: u32) -> u32 {
        self.update_height(idx);
        let bf = self.balance_factor(idx);
        if bf > 1 {
            // a left-heavy node with a right-heavy left child rotates twice
            if let Some(left) = self.node(idx).left {
                if self.balance_factor(left) < 0 {
                    let new_left = self.rotate_left(left);
                    self.node_mut(idx).left = Some(new_left);
                }
            }
            self.rotate_right(idx)
        } else if bf < -1 {
            if let Some(right) = self.node(idx).right {
                if self.balance_factor(right) > 0 {
                    let new_right = self.rotate_right(right);
                    self.node_mut(idx).right = Some(new_right);
                }
            }
            self.rotate_left(idx)
        } else {
            idx
        }
    }

    /// Total order over nodes: scalar key first, full selector on key
    /// collision, arena slot last so duplicates of the same selector are
    /// distinct tree members.
    fn rank(&self, idx: u32) -> (u32, Selector, u32) {
        let n = self.node(idx);
        (n.key, n.selector, idx)
    }

    pub fn insert(&mut self, listener: Listener) -> ListenerId {
        let key = listener.selector.tree_key();
        let node = Node {
            key,
            selector: listener.selector,
            handler: Some(listener.handler),
            left: None,
            right: None,
            height: 1,
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.gens.push(0);
                (self.nodes.len() - 1) as u32
            }
        };
        self.root = Some(self.insert_at(self.root, idx));
        self.id_for(idx)
    }

    fn id_for(&self, slot: u32) -> ListenerId {
        ListenerId {
            slot,
            r#gen: self.gens[slot as usize],
        }
    }

    /// A stale handle outlives its listener; the tag mismatch makes it
    /// inert instead of aliasing whatever reused the slot.
    fn live_slot(&self, id: ListenerId) -> Option<u32> {
        if self.gens.get(id.slot as usize) != Some(&id.r#gen) {
            return None;
        }
        self.nodes
            .get(id.slot as usize)?
            .as_ref()
            .map(|_| id.slot)
    }

    fn insert_at(&mut self, at: Option<u32>, idx: u32) -> u32 {
        let Some(at) = at else {
            return idx;
        };
        if self.rank(idx) < self.rank(at) {
            let child = self.insert_at(self.node(at).left, idx);
            self.node_mut(at).left = Some(child);
        } else {
            let child = self.insert_at(self.node(at).right, idx);
            self.node_mut(at).right = Some(child);
        }
        self.rebalance(at)
    }

    /// The first registered listener matching `selector` exactly.
    pub fn find(&self, selector: &Selector) -> Option<ListenerId> {
        let key = selector.tree_key();
        let mut at = self.root;
        let mut best: Option<u32> = None;
        while let Some(idx) = at {
            let n = self.node(idx);
            if (key, *selector) < (n.key, n.selector) {
                at = n.left;
            } else if (key, *selector) > (n.key, n.selector) {
                at = n.right;
            } else {
                // equal selectors are ordered by slot, so the earliest
                // registration is the leftmost match
                best = Some(idx);
                at = n.left;
            }
        }
        best.map(|idx| self.id_for(idx))
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let Some(idx) = self.live_slot(id) else {
            return false;
        };
        let rank = self.rank(idx);
        self.root = self.remove_at(self.root, rank);
        self.nodes[idx as usize] = None;
        self.gens[idx as usize] = self.gens[idx as usize].wrapping_add(1);
        self.free.push(idx);
        true
    }

    fn remove_at(&mut self, at: Option<u32>, rank: (u32, Selector, u32)) -> Option<u32> {
        let at_idx = at?;
        let here = self.rank(at_idx);
        if rank < here {
            let child = self.remove_at(self.node(at_idx).left, rank);
            self.node_mut(at_idx).left = child;
        } else if rank > here {
            let child = self.remove_at(self.node(at_idx).right, rank);
            self.node_mut(at_idx).right = child;
        } else {
            let n = self.node(at_idx);
            match (n.left, n.right) {
                (None, right) => return right.map(|r| self.rebalance(r)),
                (left, None) => return left.map(|l| self.rebalance(l)),
                (Some(_), Some(right)) => {
                    // replace with the in-order successor
                    let mut succ = right;
                    while let Some(l) = self.node(succ).left {
                        succ = l;
                    }
                    let succ_rank = self.rank(succ);
                    let new_right = self.remove_at(Some(right), succ_rank);
                    let n = self.node(at_idx);
                    let (left, height) = (n.left, n.height);
                    let s = self.node_mut(succ);
                    s.left = left;
                    s.right = new_right;
                    s.height = height;
                    return Some(self.rebalance(succ));
                }
            }
        }
        Some(self.rebalance(at_idx))
    }

    /// Takes the handler out of its node so it can run without borrowing
    /// the tree (and without holding the connection lock).
    pub fn take_handler(&mut self, id: ListenerId) -> Option<Handler> {
        let idx = self.live_slot(id)?;
        self.node_mut(idx).handler.take()
    }

    /// Puts a handler back after dispatch. If the listener was removed
    /// while its handler was out, the handler is simply dropped, even
    /// when its slot was reused by a newer registration.
    pub fn restore_handler(&mut self, id: ListenerId, handler: Handler) {
        if let Some(idx) = self.live_slot(id) {
            self.node_mut(idx).handler = Some(handler);
        }
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.height(self.root) as usize
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::msg_type;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn noop() -> Handler {
        Box::new(|_, _| {})
    }

    fn sel(mtype: u32, widget: u32, code: u16, detail: Detail) -> Selector {
        Selector {
            mtype,
            widget,
            code,
            detail,
        }
    }

    #[test]
    fn exact_match_only() {
        let mut tree = ListenerTree::new();
        let id = tree.insert(Listener::key(10, 27, 0x2, noop()));
        tree.insert(Listener::gadget(10, 27, noop()));

        // same widget and code, different type and shift
        let exact = sel(msg_type::KEY, 10, 27, Detail::Shift(0x2));
        assert_eq!(tree.find(&exact), Some(id));

        let wrong_shift = sel(msg_type::KEY, 10, 27, Detail::Shift(0x4));
        assert_eq!(tree.find(&wrong_shift), None);

        let wrong_widget = sel(msg_type::KEY, 11, 27, Detail::Shift(0x2));
        assert_eq!(tree.find(&wrong_widget), None);
    }

    #[test]
    fn removal_by_id_unlinks_only_that_listener() {
        let mut tree = ListenerTree::new();
        let a = tree.insert(Listener::gadget(1, 1, noop()));
        let b = tree.insert(Listener::gadget(2, 2, noop()));
        assert!(tree.remove(a));
        assert!(!tree.remove(a));
        assert_eq!(tree.find(&sel(msg_type::GADGET, 1, 1, Detail::None)), None);
        assert_eq!(tree.find(&sel(msg_type::GADGET, 2, 2, Detail::None)), Some(b));
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut tree = ListenerTree::new();
        let a = tree.insert(Listener::gadget(1, 1, noop()));
        tree.remove(a);
        let b = tree.insert(Listener::gadget(3, 3, noop()));
        // same slot, fresh generation
        assert_ne!(a, b);
        assert_eq!(tree.count(), 1);
        assert!(!tree.remove(a));
        assert!(tree.remove(b));
    }

    #[test]
    fn stale_handle_cannot_reach_a_reused_slot() {
        let mut tree = ListenerTree::new();
        let a = tree.insert(Listener::gadget(1, 1, noop()));
        let out = tree.take_handler(a).unwrap();

        // the handler deregisters itself and registers a replacement,
        // which lands in the vacated slot
        tree.remove(a);
        let marker = Arc::new(());
        let m = Arc::clone(&marker);
        let b = tree.insert(Listener::gadget(2, 2, Box::new(move |_, _| {
            let _ = &m;
        })));

        tree.restore_handler(a, out);
        // the replacement's handler must survive the stale restore
        assert_eq!(Arc::strong_count(&marker), 2);
        assert!(tree.take_handler(b).is_some());
        assert!(tree.take_handler(a).is_none());
    }

    #[test]
    fn tree_stays_balanced_under_sequential_inserts() {
        let mut tree = ListenerTree::new();
        for i in 0..1024u32 {
            tree.insert(Listener::gadget(i, 0, noop()));
        }
        assert_eq!(tree.count(), 1024);
        // height of an AVL tree with n nodes is below 1.45 * log2(n + 2)
        assert!(tree.depth() <= 15, "depth {}", tree.depth());

        for i in (0..1024u32).step_by(2) {
            let id = tree
                .find(&sel(msg_type::GADGET, i, 0, Detail::None))
                .unwrap();
            assert!(tree.remove(id));
        }
        assert_eq!(tree.count(), 512);
        for i in 0..1024u32 {
            let found = tree.find(&sel(msg_type::GADGET, i, 0, Detail::None));
            assert_eq!(found.is_some(), i % 2 == 1, "widget {i}");
        }
    }

    #[test]
    fn duplicate_selectors_coexist_and_remove_independently() {
        let mut tree = ListenerTree::new();
        let first = tree.insert(Listener::gadget(5, 5, noop()));
        let second = tree.insert(Listener::gadget(5, 5, noop()));
        assert_ne!(first, second);

        let probe = sel(msg_type::GADGET, 5, 5, Detail::None);
        assert_eq!(tree.find(&probe), Some(first));
        assert!(tree.remove(first));
        assert_eq!(tree.find(&probe), Some(second));
    }

    #[test]
    fn handler_can_be_taken_and_restored() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut tree = ListenerTree::new();
        let h = Arc::clone(&hits);
        let id = tree.insert(Listener::control(
            9,
            Box::new(move |_, _| {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        ));

        let handler = tree.take_handler(id).unwrap();
        assert!(tree.take_handler(id).is_none());
        tree.restore_handler(id, handler);
        assert!(tree.take_handler(id).is_some());
        let _ = hits;
    }
}
