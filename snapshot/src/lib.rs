// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Copy-on-write snapshots of guest state and the time-travel log over them.
//!
//! Every executed instruction gets a [`Snapshot`]: the full register file
//! plus a [`BlockTree`] view of guest physical memory that shares all
//! unchanged ranges with the previous snapshot. [`History`] strings the
//! snapshots together and moves a cursor through them, which is all that
//! reverse-stepping is.

pub mod block_tree;
pub mod history;
pub mod snapshot;

pub use block_tree::BlockTree;
pub use block_tree::MIN_LEAF;
pub use history::History;
pub use snapshot::Snapshot;
