// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A copy-on-write binary tree over a guest memory image.
//!
//! Successive snapshots of guest memory are nearly identical, so storing a
//! full copy per executed instruction would be quadratic waste. A
//! [`BlockTree`] built on top of the previous one re-uses every subtree whose
//! bytes did not change and only allocates nodes covering the modified
//! ranges, down to [`MIN_LEAF`]-byte granularity. Nodes are immutable and
//! shared through `Arc`, so a tree costs memory proportional to what actually
//! changed since its base.

use std::sync::Arc;

/// Minimum node size in bytes; a node of this size is never split.
pub const MIN_LEAF: u64 = 64;

/// A node covering a power-of-two byte range of the memory image. Inner
/// nodes split their range exactly in half; reads address a node relative to
/// the start of its range, so nodes need no absolute offset of their own.
enum Node {
    Leaf {
        bytes: Arc<[u8]>,
    },
    Inner {
        size: u64,
        left: Arc<Node>,
        right: Arc<Node>,
    },
}

impl Node {
    fn size(&self) -> u64 {
        match self {
            Node::Leaf { bytes } => bytes.len() as u64,
            Node::Inner { size, .. } => *size,
        }
    }

    /// Copies `dest.len()` bytes starting at `rel_off` (relative to this
    /// node's range) into `dest`. The request must lie within the node.
    fn read(&self, dest: &mut [u8], rel_off: u64) {
        let len = dest.len() as u64;
        debug_assert!(rel_off + len <= self.size());

        match self {
            Node::Leaf { bytes } => {
                dest.copy_from_slice(&bytes[rel_off as usize..(rel_off + len) as usize]);
            }
            Node::Inner { size, left, right } => {
                let middle = size / 2;
                let read_left = rel_off < middle;
                let read_right = middle < rel_off + len;

                if read_left {
                    let left_len = (rel_off + len).min(middle) - rel_off;
                    left.read(&mut dest[..left_len as usize], rel_off);
                }
                if read_right {
                    // Data below `middle` went to the left child, so skip
                    // whatever the left read already produced.
                    let right_off = middle.max(rel_off) - middle;
                    let dest_skip = if read_left { (middle - rel_off) as usize } else { 0 };
                    right.read(&mut dest[dest_skip..], right_off);
                }
            }
        }
    }
}

/// A snapshot of a memory image with structural sharing against its base.
///
/// The root covers the enclosing power of two of the described size; the gap
/// past `logical_size` is zero filled and never observable through reads.
pub struct BlockTree {
    root: Arc<Node>,
    /// Size the caller described. Reads past it yield zeroes.
    logical_size: u64,
}

impl BlockTree {
    /// Builds a tree describing `data`, sharing every subtree of `base`
    /// whose range is byte-identical in `data`. Without a base the whole
    /// image becomes a single leaf; splits only happen where changes force
    /// them, so trees stay shallow while change footprints are small.
    ///
    /// `data.len()` must be a multiple of [`MIN_LEAF`]; a chained `base`
    /// must describe an image of the same size.
    pub fn new(base: Option<&BlockTree>, data: &[u8]) -> BlockTree {
        let logical_size = data.len() as u64;
        assert_eq!(
            logical_size % MIN_LEAF,
            0,
            "memory size must be a multiple of {} bytes",
            MIN_LEAF
        );
        let padded_size = logical_size.next_power_of_two().max(MIN_LEAF);
        if let Some(base) = base {
            assert_eq!(base.logical_size, logical_size, "base describes a different image size");
        }

        let padded;
        let image: &[u8] = if padded_size == logical_size {
            data
        } else {
            padded = {
                let mut v = vec![0u8; padded_size as usize];
                v[..data.len()].copy_from_slice(data);
                v
            };
            &padded
        };

        let root = build(base.map(|b| &b.root), image, 0, padded_size);
        BlockTree { root, logical_size }
    }

    /// Reads exactly `size` bytes at `offset`. The part of the request past
    /// the described image (if any) reads as zeroes.
    pub fn read(&self, offset: u64, size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; size as usize];
        if offset >= self.logical_size {
            return buf;
        }
        let to_read = size.min(self.logical_size - offset);
        self.root.read(&mut buf[..to_read as usize], offset);
        buf
    }

    /// Size in bytes of the described memory image.
    pub fn size(&self) -> u64 {
        self.logical_size
    }
}

fn build(base: Option<&Arc<Node>>, image: &[u8], offset: u64, size: u64) -> Arc<Node> {
    debug_assert!(size >= MIN_LEAF && size.is_power_of_two());
    let range = &image[offset as usize..(offset + size) as usize];

    let Some(base_node) = base else {
        // Nothing to share against; one leaf covers the whole range.
        return Arc::new(Node::Leaf {
            bytes: Arc::from(range),
        });
    };

    let mut scratch = vec![0u8; size as usize];
    base_node.read(&mut scratch, 0);
    if scratch == range {
        return Arc::clone(base_node);
    }
    if size == MIN_LEAF {
        return Arc::new(Node::Leaf {
            bytes: Arc::from(range),
        });
    }

    // This range keeps changing; split it so the halves get a chance to be
    // shared next time. A base leaf has no children to descend into, in
    // which case the halves start over without a base.
    let (base_left, base_right) = match base_node.as_ref() {
        Node::Inner { left, right, .. } => (Some(left), Some(right)),
        Node::Leaf { .. } => (None, None),
    };
    let half = size / 2;
    let left = build(base_left, image, offset, half);
    let right = build(base_right, image, offset + half, half);
    Arc::new(Node::Inner { size, left, right })
}
