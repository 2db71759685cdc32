//! Chained fixed-capacity byte buffers.
//!
//! Every connection's outbound queue is a [`BufferChain`]: a forward list
//! of fixed-capacity nodes, appended at the tail and consumed from the
//! head. Nodes are allocated lazily on append and freed exactly when their
//! last byte is consumed, so a drained chain holds no memory.

use std::collections::VecDeque;

use wirehub_core::{constants::NODE_CAPACITY, error::Result};

/// One fixed-capacity node in a [`BufferChain`].
///
/// Invariant: `consumed <= data.len() <= capacity`. A node with
/// `consumed == data.len()` never stays in a chain.
#[derive(Debug)]
pub struct BufferNode {
    data: Vec<u8>,
    consumed: usize,
}

impl BufferNode {
    /// Allocates an empty node. Allocation failure is returned rather
    /// than aborting, so the owning connection can be closed instead.
    pub fn with_capacity(capacity: usize) -> Result<BufferNode> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        Ok(BufferNode { data, consumed: 0 })
    }

    /// Wraps already-filled bytes in a node, e.g. compressor output.
    pub fn from_vec(data: Vec<u8>) -> BufferNode {
        BufferNode { data, consumed: 0 }
    }

    /// The not-yet-consumed bytes of this node.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    /// Count of not-yet-consumed bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.consumed
    }

    /// Bytes currently stored in the node.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the node holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True once no writable space remains.
    pub fn is_full(&self) -> bool {
        self.spare() == 0
    }

    fn spare(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// A forward list of [`BufferNode`]s with independent append and consume.
#[derive(Debug, Default)]
pub struct BufferChain {
    nodes: VecDeque<BufferNode>,
}

impl BufferChain {
    /// Creates an empty chain. No memory is held until the first append.
    pub fn new() -> BufferChain {
        BufferChain { nodes: VecDeque::new() }
    }

    /// Appends `bytes` to the tail, filling the current tail node before
    /// allocating new ones. On allocation failure the chain is left
    /// holding whatever fit; the caller closes the connection.
    pub fn append(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let needs_node = match self.nodes.back() {
                Some(tail) => tail.spare() == 0,
                None => true,
            };
            if needs_node {
                self.nodes.push_back(BufferNode::with_capacity(NODE_CAPACITY)?);
            }
            let tail = self.nodes.back_mut().unwrap();
            let count = bytes.len().min(tail.spare());
            tail.data.extend_from_slice(&bytes[..count]);
            bytes = &bytes[count..];
        }
        Ok(())
    }

    /// Splices an already-filled node onto the tail. Empty nodes are
    /// dropped rather than linked.
    pub fn append_node(&mut self, node: BufferNode) {
        if node.remaining() > 0 {
            self.nodes.push_back(node);
        }
    }

    /// Marks `n` bytes consumed from the head, unlinking nodes as they
    /// drain. `n` must not exceed [`size`](Self::size).
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let head = self.nodes.front_mut().expect("consume past end of chain");
            let count = n.min(head.remaining());
            head.consumed += count;
            n -= count;
            if head.remaining() == 0 {
                self.nodes.pop_front();
            }
        }
    }

    /// Sum of unconsumed bytes across all nodes.
    pub fn size(&self) -> usize {
        self.nodes.iter().map(BufferNode::remaining).sum()
    }

    /// True if no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The head node's unconsumed bytes, if any.
    pub fn head(&self) -> Option<&[u8]> {
        self.nodes.front().map(BufferNode::unconsumed)
    }

    /// True if exactly one node is queued. The compressor sync-flushes on
    /// the final node so partial messages are never withheld.
    pub fn is_single_node(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Releases every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_then_consume_everything() {
        let mut chain = BufferChain::new();
        chain.append(b"hello world").unwrap();
        assert_eq!(chain.size(), 11);
        assert_eq!(chain.head().unwrap(), b"hello world");
        chain.consume(11);
        assert!(chain.is_empty());
        assert_eq!(chain.size(), 0);
    }

    #[test]
    fn test_append_spans_node_boundary() {
        let big = vec![0xabu8; NODE_CAPACITY + 100];
        let mut chain = BufferChain::new();
        chain.append(&big).unwrap();
        assert_eq!(chain.size(), big.len());
        assert_eq!(chain.head().unwrap().len(), NODE_CAPACITY);
        chain.consume(NODE_CAPACITY);
        assert_eq!(chain.size(), 100);
        assert_eq!(chain.head().unwrap(), &big[..100]);
    }

    #[test]
    fn test_partial_consume_keeps_head() {
        let mut chain = BufferChain::new();
        chain.append(b"abcdef").unwrap();
        chain.consume(2);
        assert_eq!(chain.head().unwrap(), b"cdef");
        assert_eq!(chain.size(), 4);
    }

    #[test]
    fn test_conservation_over_interleaved_operations() {
        let mut chain = BufferChain::new();
        let mut appended = 0usize;
        let mut consumed = 0usize;
        for round in 1..=50usize {
            let bytes = vec![round as u8; round * 37];
            chain.append(&bytes).unwrap();
            appended += bytes.len();
            let take = (round * 13) % (chain.size() + 1);
            chain.consume(take);
            consumed += take;
            assert_eq!(chain.size(), appended - consumed);
        }
        let rest = chain.size();
        chain.consume(rest);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_append_node_skips_empty() {
        let mut chain = BufferChain::new();
        chain.append_node(BufferNode::from_vec(Vec::new()));
        assert!(chain.is_empty());
        chain.append_node(BufferNode::from_vec(vec![1, 2, 3]));
        assert_eq!(chain.size(), 3);
        assert!(chain.is_single_node());
    }

    #[test]
    fn test_consume_across_spliced_nodes() {
        let mut chain = BufferChain::new();
        chain.append_node(BufferNode::from_vec(vec![1; 10]));
        chain.append_node(BufferNode::from_vec(vec![2; 10]));
        assert!(!chain.is_single_node());
        chain.consume(15);
        assert_eq!(chain.size(), 5);
        assert_eq!(chain.head().unwrap(), &[2u8; 5][..]);
    }
}
