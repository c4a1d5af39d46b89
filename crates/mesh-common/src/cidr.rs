//! IPv4 longest-prefix-match tree.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Binary trie over IPv4 address bits. Backs rule CIDR predicates, the
/// node's owned-address set, and peer claimed-subnet lookups.
#[derive(Debug, Clone)]
pub struct Ipv4Tree<T> {
    root: Node<T>,
}

#[derive(Debug, Clone)]
struct Node<T> {
    value: Option<T>,
    zero: Option<Box<Node<T>>>,
    one: Option<Box<Node<T>>>,
}

impl<T> Node<T> {
    const fn empty() -> Self {
        Self {
            value: None,
            zero: None,
            one: None,
        }
    }

    fn child(&self, bit: u32) -> Option<&Node<T>> {
        if bit == 0 {
            self.zero.as_deref()
        } else {
            self.one.as_deref()
        }
    }
}

impl<T> Default for Ipv4Tree<T> {
    fn default() -> Self {
        Self {
            root: Node::empty(),
        }
    }
}

impl<T> Ipv4Tree<T> {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a network. The value sits at the node for the masked prefix;
    /// inserting the same prefix twice replaces the value.
    pub fn add(&mut self, net: Ipv4Network, value: T) {
        let bits = u32::from(net.network());
        let mut node = &mut self.root;
        for i in 0..net.prefix() {
            let bit = (bits >> (31 - i)) & 1;
            let child = if bit == 0 {
                &mut node.zero
            } else {
                &mut node.one
            };
            node = child.get_or_insert_with(|| Box::new(Node::empty()));
        }
        node.value = Some(value);
    }

    /// True if any inserted prefix covers the address.
    #[inline]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.longest_match(ip).is_some()
    }

    /// Most-specific value whose prefix covers the address.
    pub fn longest_match(&self, ip: Ipv4Addr) -> Option<&T> {
        let bits = u32::from(ip);
        let mut node = &self.root;
        let mut best = node.value.as_ref();
        for i in 0..32 {
            match node.child((bits >> (31 - i)) & 1) {
                Some(next) => {
                    node = next;
                    if node.value.is_some() {
                        best = node.value.as_ref();
                    }
                }
                None => break,
            }
        }
        best
    }

    /// True if nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.root.value.is_none() && self.root.zero.is_none() && self.root.one.is_none()
    }
}
