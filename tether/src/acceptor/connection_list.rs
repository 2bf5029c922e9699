use slab::Slab;

struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list stored in a slab.
///
/// Keys stay valid while a node is moved around, so callers can keep them as
/// cursors. A key is recycled once its node is removed.
pub(crate) struct ConnectionList<T> {
    nodes: Slab<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<T> Default for ConnectionList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionList<T> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn contains(&self, key: usize) -> bool {
        self.nodes.contains(key)
    }

    pub(crate) fn front(&self) -> Option<usize> {
        self.head
    }

    pub(crate) fn back(&self) -> Option<usize> {
        self.tail
    }

    pub(crate) fn next(&self, key: usize) -> Option<usize> {
        self.nodes.get(key).and_then(|node| node.next)
    }

    pub(crate) fn prev(&self, key: usize) -> Option<usize> {
        self.nodes.get(key).and_then(|node| node.prev)
    }

    pub(crate) fn get(&self, key: usize) -> Option<&T> {
        self.nodes.get(key).map(|node| &node.value)
    }

    pub(crate) fn push_front(&mut self, value: T) -> usize {
        let key = self.nodes.insert(Node {
            value,
            prev: None,
            next: None,
        });
        self.link_front(key);
        key
    }

    pub(crate) fn push_back(&mut self, value: T) -> usize {
        let key = self.nodes.insert(Node {
            value,
            prev: None,
            next: None,
        });
        self.link_back(key);
        key
    }

    pub(crate) fn remove(&mut self, key: usize) -> Option<T> {
        if !self.nodes.contains(key) {
            return None;
        }
        self.unlink(key);
        Some(self.nodes.remove(key).value)
    }

    pub(crate) fn pop_front(&mut self) -> Option<(usize, T)> {
        let key = self.head?;
        self.remove(key).map(|value| (key, value))
    }

    pub(crate) fn move_to_front(&mut self, key: usize) {
        if self.nodes.contains(key) && self.head != Some(key) {
            self.unlink(key);
            self.link_front(key);
        }
    }

    pub(crate) fn move_to_back(&mut self, key: usize) {
        if self.nodes.contains(key) && self.tail != Some(key) {
            self.unlink(key);
            self.link_back(key);
        }
    }

    /// Keys from front to back.
    pub(crate) fn keys(&self) -> Keys<'_, T> {
        Keys {
            list: self,
            cursor: self.head,
        }
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = {
            let node = &self.nodes[key];
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        let node = &mut self.nodes[key];
        node.prev = None;
        node.next = None;
    }

    fn link_front(&mut self, key: usize) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[key];
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(old_head) => self.nodes[old_head].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
    }

    fn link_back(&mut self, key: usize) {
        let old_tail = self.tail;
        {
            let node = &mut self.nodes[key];
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(old_tail) => self.nodes[old_tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
    }
}

pub(crate) struct Keys<'a, T> {
    list: &'a ConnectionList<T>,
    cursor: Option<usize>,
}

impl<T> Iterator for Keys<'_, T> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let key = self.cursor?;
        self.cursor = self.list.next(key);
        Some(key)
    }
}
