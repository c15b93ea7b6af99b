#![forbid(unsafe_code)]
//! Writing a modified tree into a new committed image.
//!
//! Nodes above the baseline are appended to a copy of the committed image,
//! children first, so every ref a node holds is already final when the node
//! is written. Committed subtrees are referenced where they are. The new
//! top ref goes into the inactive header slot, which is then selected.

use std::sync::Arc;

use tracing::debug;

use crate::primitives::io::FileIo;
use crate::primitives::slab::{Allocator, SlabAlloc};
use crate::storage::compress::{choose_encoding, Compressor};
use crate::storage::node::{Array, Encoding, NodeHeader, HEADER_SIZE};
use crate::types::file::FILE_HEADER_LEN;
use crate::types::{Ref, Result, StrataError};

/// Knobs for one commit.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommitOptions {
    /// Re-encode integer leaves with the smallest encoding that pays off.
    pub compress: bool,
}

/// Outcome of a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitReport {
    /// Top ref recorded in the new header.
    pub top_ref: Ref,
    /// Nodes appended to the image.
    pub nodes_written: usize,
    /// Bytes appended to the image.
    pub bytes_written: usize,
    /// Baseline of the new image.
    pub baseline: u64,
}

/// Growing copy of the committed image that new nodes are appended to.
#[derive(Debug)]
pub struct ImageWriter {
    buf: Vec<u8>,
    base_len: usize,
    nodes: usize,
    compress: bool,
}

impl ImageWriter {
    /// Starts from the committed image `base`.
    pub fn new(base: &[u8], options: CommitOptions) -> Self {
        Self {
            buf: base.to_vec(),
            base_len: base.len(),
            nodes: 0,
            compress: options.compress,
        }
    }

    /// Bytes appended so far.
    pub fn appended(&self) -> usize {
        self.buf.len() - self.base_len
    }

    /// Nodes appended so far.
    pub fn nodes_written(&self) -> usize {
        self.nodes
    }

    /// The image built so far.
    pub fn image(&self) -> &[u8] {
        &self.buf
    }

    fn push(&mut self, node: &[u8]) -> Result<Ref> {
        if node.len() % 8 != 0 {
            return Err(StrataError::Corruption("node image is not 8-byte aligned"));
        }
        let at = self.buf.len() as u64;
        self.buf.extend_from_slice(node);
        self.nodes += 1;
        Ok(Ref(at))
    }

    fn into_image(self) -> Vec<u8> {
        self.buf
    }
}

/// Serialises the node at `ref_` and every slab node below it.
///
/// Returns the ref the node has in the new image. Null refs and refs into
/// the committed image are returned unchanged. Written nodes have capacity
/// equal to their byte size.
pub fn write_deep(alloc: &dyn Allocator, ref_: Ref, out: &mut ImageWriter) -> Result<Ref> {
    if ref_.is_null() || alloc.is_read_only(ref_) {
        return Ok(ref_);
    }
    let node = Array::from_ref(alloc, ref_)?;
    if node.has_refs() {
        let mut values = node.get_all(alloc, 0, node.len())?;
        for value in &mut values {
            if Ref::is_valid_child(*value) {
                *value = write_deep(alloc, Ref::from_value(*value), out)?.to_value();
            }
        }
        let header = NodeHeader {
            capacity: HEADER_SIZE + values.len() * 8,
            ..*node.header()
        };
        let mut image = vec![0u8; header.capacity];
        header.encode(&mut image)?;
        for (slot, value) in image[HEADER_SIZE..].chunks_exact_mut(8).zip(&values) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        return out.push(&image);
    }
    if out.compress && !node.is_compressed() && node.header().encoding == Encoding::Bits {
        let values = node.get_all(alloc, 0, node.len())?;
        if let Some(encoding) = choose_encoding(&values) {
            let compressor = Compressor::for_values(encoding, &values)?;
            let header = NodeHeader {
                encoding,
                width: 0,
                capacity: compressor.node_byte_size(values.len()),
                ..*node.header()
            };
            let mut image = vec![0u8; header.capacity];
            header.encode(&mut image)?;
            compressor.encode_into(&values, &mut image[HEADER_SIZE..])?;
            return out.push(&image);
        }
    }
    let size = node.byte_size();
    let mut image = alloc
        .bytes(node.mem())?
        .get(..size)
        .ok_or(StrataError::Corruption("node extends past its region"))?
        .to_vec();
    let header = NodeHeader {
        capacity: size,
        ..*node.header()
    };
    header.encode(&mut image)?;
    out.push(&image)
}

/// Commits the tree rooted at `top` and rebases `alloc` onto the result.
///
/// With `io`, the appended nodes and the staged header slot are written
/// and synced before the slot is selected and synced again, so a crash
/// leaves either the old or the new top ref current.
pub fn commit(
    alloc: &mut SlabAlloc,
    top: Ref,
    io: Option<&dyn FileIo>,
    options: CommitOptions,
) -> Result<CommitReport> {
    let committed = alloc.committed_image();
    let mut out = ImageWriter::new(&committed, options);
    let top_ref = write_deep(&*alloc, top, &mut out)?;
    let nodes_written = out.nodes_written();
    let bytes_written = out.appended();
    let mut image = out.into_image();

    let mut header = alloc.header().clone();
    let slot = header.stage(top_ref, header.format_version());
    let mut staged = [0u8; FILE_HEADER_LEN];
    header.encode(&mut staged)?;
    header.select(slot);
    header.encode(&mut image)?;

    if let Some(io) = io {
        let old_len = committed.len();
        let from = if io.len()? == old_len as u64 {
            old_len
        } else {
            FILE_HEADER_LEN
        };
        io.write_at(from as u64, &image[from..])?;
        io.truncate(image.len() as u64)?;
        io.write_at(0, &staged)?;
        io.sync_all()?;
        io.write_at(0, &image[..FILE_HEADER_LEN])?;
        io.sync_all()?;
    }

    let baseline = image.len() as u64;
    alloc.rebase(Arc::from(image))?;
    debug!(
        top_ref = top_ref.0,
        slot,
        nodes = nodes_written,
        bytes = bytes_written,
        baseline,
        "commit.write.complete"
    );
    Ok(CommitReport {
        top_ref,
        nodes_written,
        bytes_written,
        baseline,
    })
}
