// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Block-wise transfer support ([IETF-RFC7959]).
//!
//! A logical payload larger than the negotiated block size travels across
//! multiple exchanges. The token identifies the logical transfer; each block
//! exchange has its own message id. [`BlockReconstructor`] reassembles the
//! receiving side, [`BlockSegmenter`] produces the sending side.
//!
//! [IETF-RFC7959]: https://tools.ietf.org/html/rfc7959

use super::consts::MAX_BLOCK_BYTES_XFER;
use super::Error;
use std::fmt::{Debug, Display, Formatter};

/// Type for interpreting `Block1` and `Block2` option values.
///
/// The value packs a triple (NUM, M, SZX): the 0-based block index, the
/// "more blocks follow" flag, and the block size exponent, where the block
/// size is `2^(SZX+4)` bytes.
#[derive(Copy, Clone, Eq, Ord, Hash, PartialOrd, PartialEq)]
pub struct BlockInfo(pub u32);

impl BlockInfo {
    const MORE_FLAG: u32 = 0b1000;

    /// Maximum legal value for `num`.
    pub const NUM_MAX: u32 = (1 << 20) - 1;

    const SZX_RESERVED: u8 = 0b0111;

    /// Maximum legal value for `szx`.
    pub const SZX_MAX: u8 = Self::SZX_RESERVED - 1;

    /// Constructs a new `BlockInfo` from the number, more flag, and size exponent.
    pub fn new(num: u32, m: bool, szx: u8) -> Option<BlockInfo> {
        if num > Self::NUM_MAX || szx > Self::SZX_MAX {
            None
        } else {
            Some(BlockInfo((num << 4) + ((m as u32) << 3) + szx as u32))
        }
    }

    /// Block number value.
    #[inline]
    pub fn num(&self) -> u32 {
        self.0 >> 4
    }

    /// More flag value. If set, there are more blocks to follow.
    #[inline]
    pub fn more_flag(&self) -> bool {
        (self.0 & Self::MORE_FLAG) == Self::MORE_FLAG
    }

    /// Block size exponent field value.
    #[inline]
    pub fn szx(&self) -> u8 {
        self.0 as u8 & 0b111
    }

    /// The offset (in bytes) that this block starts at.
    #[inline]
    pub fn offset(&self) -> usize {
        let val = self.0 as usize;
        (val & !0xF) << (val & 0b0111)
    }

    /// The length of this block, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        1 << (self.szx() as usize + 4)
    }

    /// Determines if calling [`BlockInfo::next`] will yield the next block or not.
    pub fn is_max_block(&self) -> bool {
        self.num() == Self::NUM_MAX
    }

    /// Checks the validity of the contained value.
    pub fn is_invalid(&self) -> bool {
        (self.num() > Self::NUM_MAX) || self.szx() == Self::SZX_RESERVED
    }

    /// Checks the contained value for validity and, if valid, returns it in an `Option`.
    pub fn valid(self) -> Option<BlockInfo> {
        if self.is_invalid() {
            None
        } else {
            Some(self)
        }
    }

    /// Calculates what the next block will be, if any.
    pub fn next(&self) -> Option<BlockInfo> {
        if self.num() < Self::NUM_MAX {
            BlockInfo(self.0 + 0x10).valid()
        } else {
            None
        }
    }

    /// Calculates a smaller block size that maintains this block's offset.
    pub fn smaller(&self) -> Option<BlockInfo> {
        let szx = self.szx();
        if szx != Self::SZX_RESERVED && szx > 0 {
            Self::new(self.num() * 2, self.more_flag(), szx - 1)
        } else {
            None
        }
    }

    /// Returns this `BlockInfo`'s value *with* the more flag set.
    pub fn with_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 | Self::MORE_FLAG)
    }

    /// Returns this `BlockInfo`'s value *without* the more flag set.
    pub fn without_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 & !Self::MORE_FLAG)
    }
}

impl From<u32> for BlockInfo {
    fn from(x: u32) -> Self {
        BlockInfo(x)
    }
}

impl Default for BlockInfo {
    /// Returns a block info with an offset of zero and a block size of 1024.
    fn default() -> Self {
        BlockInfo(super::consts::DEFAULT_BLOCK_SZX as u32)
    }
}

impl Display for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}/{}/{}",
            self.num(),
            self.more_flag() as u8,
            self.len()
        )?;
        if self.is_invalid() {
            f.write_str("(!)")
        } else {
            Ok(())
        }
    }
}

impl Debug for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "BlockInfo(0x{:06X}/", self.0)?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

/// Outcome of feeding one block into a [`BlockReconstructor`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockFeed {
    /// The block was accepted; more blocks are expected.
    More,

    /// The block was accepted and it was the final block.
    Finished,

    /// The block was a duplicate of one already received and was ignored.
    Duplicate,
}

/// Reassembles a block-wise transfer on the receiving side.
///
/// Works for both `Block1` (request payload) and `Block2` (response payload)
/// directions. Blocks are accepted strictly in order starting at zero; a gap
/// or overshoot is a [`Error::BlockMismatch`], which the caller maps to 4.08
/// Request Entity Incomplete and drops the buffer. The peer may switch to a
/// smaller block size mid-transfer; switching to a larger one is a
/// [`Error::BlockMismatch`] as well (4.13 on the server side).
#[derive(Debug)]
pub struct BlockReconstructor {
    buffer: Vec<u8>,
    next_block: BlockInfo,
    is_finished: bool,
    size_hint: Option<u32>,
}

impl BlockReconstructor {
    /// Creates a new, empty `BlockReconstructor` expecting block zero with
    /// the given (maximum) block size exponent.
    pub fn new(szx: u8) -> BlockReconstructor {
        BlockReconstructor {
            buffer: Vec::new(),
            next_block: BlockInfo::new(0, false, szx).unwrap_or_default(),
            is_finished: false,
            size_hint: None,
        }
    }

    /// The next block this object wants.
    pub fn next_block(&self) -> BlockInfo {
        self.next_block
    }

    /// Records the total transfer size advertised in a Size1/Size2 option.
    pub fn set_size_hint(&mut self, size: u32) {
        self.size_hint = Some(size);
    }

    /// Returns true if we have received all of our blocks.
    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    /// Number of bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if no bytes have been accumulated yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consumes this object and returns the reassembled payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.buffer
    }

    /// Feeds a block (with its associated payload) to the reconstructor.
    pub fn feed(&mut self, block: BlockInfo, payload: &[u8]) -> Result<BlockFeed, Error> {
        if self.is_finished {
            return Ok(BlockFeed::Duplicate);
        }

        if block.szx() > self.next_block.szx() {
            // The peer may shrink the block size mid-transfer, never grow it.
            return Err(Error::BlockMismatch);
        }

        if block.szx() < self.next_block.szx() {
            // Re-derive the expected block number at the new size. This is
            // only valid on a block boundary, which offset equality checks.
            let shrunk = BlockInfo::new(
                (self.buffer.len() / block.len()) as u32,
                false,
                block.szx(),
            )
            .ok_or(Error::BlockMismatch)?;
            self.next_block = shrunk;
        }

        if block.offset() < self.next_block.offset() {
            // A retransmission of a block we have already seen.
            return Ok(BlockFeed::Duplicate);
        }

        if block.offset() > self.next_block.offset() {
            // Gap: this isn't the block we were expecting.
            return Err(Error::BlockMismatch);
        }

        if block.more_flag() {
            if payload.len() != block.len() {
                // Every non-final block must be exactly full.
                return Err(Error::BlockMismatch);
            }
        } else {
            if payload.len() > block.len() {
                return Err(Error::BlockMismatch);
            }
            self.is_finished = true;
        }

        if self.buffer.len() + payload.len() > MAX_BLOCK_BYTES_XFER {
            return Err(Error::TransferTooLarge);
        }

        self.buffer.extend_from_slice(payload);

        if !self.is_finished {
            self.next_block = block
                .without_more_flag()
                .next()
                .ok_or(Error::TransferTooLarge)?;
            Ok(BlockFeed::More)
        } else {
            Ok(BlockFeed::Finished)
        }
    }
}

/// Produces the blocks of an outbound block-wise transfer.
///
/// The segmenter owns the full payload; [`BlockSegmenter::block_at`] slices
/// out the payload for any given block, so retransmitted or re-requested
/// blocks cost nothing extra.
#[derive(Debug, Clone)]
pub struct BlockSegmenter {
    payload: Vec<u8>,
    szx: u8,
}

impl BlockSegmenter {
    /// Creates a segmenter for `payload` with the given block size exponent.
    pub fn new(payload: Vec<u8>, szx: u8) -> Result<BlockSegmenter, Error> {
        if szx > BlockInfo::SZX_MAX {
            return Err(Error::InvalidArgument);
        }
        if payload.len() > MAX_BLOCK_BYTES_XFER {
            return Err(Error::TransferTooLarge);
        }

        Ok(BlockSegmenter { payload, szx })
    }

    /// Total size of the logical payload, for Size1/Size2 options.
    pub fn total_len(&self) -> usize {
        self.payload.len()
    }

    /// The block size in bytes.
    pub fn block_len(&self) -> usize {
        1 << (self.szx as usize + 4)
    }

    /// Number of blocks in this transfer. An empty payload still has one
    /// (empty) block.
    pub fn block_count(&self) -> usize {
        ((self.payload.len() + self.block_len() - 1) / self.block_len()).max(1)
    }

    /// Returns the descriptor and payload slice for block `num` at this
    /// segmenter's block size, or `None` if `num` is past the end.
    pub fn block_at(&self, num: u32) -> Option<(BlockInfo, &[u8])> {
        self.block_at_szx(num, self.szx)
    }

    /// Returns the descriptor and payload slice for block `num` at an
    /// explicitly requested block size (the peer may have negotiated down).
    pub fn block_at_szx(&self, num: u32, szx: u8) -> Option<(BlockInfo, &[u8])> {
        let block_len = 1usize << (szx as usize + 4);
        let start = num as usize * block_len;

        if num > BlockInfo::NUM_MAX || (start >= self.payload.len() && start != 0) {
            return None;
        }

        let end = (start + block_len).min(self.payload.len());
        let more = end < self.payload.len();

        Some((BlockInfo::new(num, more, szx)?, &self.payload[start..end]))
    }

    /// Returns true if the payload fits in a single block.
    pub fn is_single_block(&self) -> bool {
        self.payload.len() <= self.block_len()
    }

    /// Consumes the segmenter, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let block = BlockInfo::default();
        assert_eq!(false, block.more_flag());
        assert_eq!(6, block.szx());
        assert_eq!(0, block.num());
        assert_eq!(1024, block.len());
        assert_eq!(0, block.offset());
        assert_eq!(false, block.is_max_block());
        assert_eq!(false, block.is_invalid());
    }

    #[test]
    fn next_and_smaller() {
        let block = BlockInfo::default().next().unwrap();
        assert_eq!(1, block.num());
        assert_eq!(1024, block.offset());

        let block = block.smaller().unwrap();
        assert_eq!(5, block.szx());
        assert_eq!(2, block.num());
        assert_eq!(512, block.len());
        assert_eq!(1024, block.offset());

        assert_eq!(None, BlockInfo(0).smaller());
    }

    #[test]
    fn max_block_has_no_next() {
        let block = BlockInfo::new(BlockInfo::NUM_MAX, true, 6).unwrap();
        assert!(block.is_max_block());
        assert_eq!(None, block.next());
    }

    #[test]
    fn validity() {
        assert_eq!(None, BlockInfo(!0).valid());
        assert_eq!(None, BlockInfo(BlockInfo::SZX_RESERVED as u32).valid());
        assert!(BlockInfo(6).valid().is_some());
    }

    #[test]
    fn reassemble_in_order() {
        let mut reconstructor = BlockReconstructor::new(4);

        let b0 = BlockInfo::new(0, true, 4).unwrap();
        let b1 = BlockInfo::new(1, true, 4).unwrap();
        let b2 = BlockInfo::new(2, false, 4).unwrap();

        assert_eq!(reconstructor.feed(b0, &[b'a'; 16]), Ok(BlockFeed::More));
        assert_eq!(reconstructor.feed(b1, &[b'b'; 16]), Ok(BlockFeed::More));
        assert_eq!(reconstructor.feed(b2, &[b'c'; 3]), Ok(BlockFeed::Finished));

        let payload = reconstructor.into_payload();
        assert_eq!(payload.len(), 35);
        assert_eq!(&payload[..16], &[b'a'; 16]);
        assert_eq!(&payload[32..], &[b'c'; 3]);
    }

    #[test]
    fn gap_is_rejected() {
        let mut reconstructor = BlockReconstructor::new(4);
        let b0 = BlockInfo::new(0, true, 4).unwrap();
        let b2 = BlockInfo::new(2, true, 4).unwrap();

        assert_eq!(reconstructor.feed(b0, &[0; 16]), Ok(BlockFeed::More));
        assert_eq!(reconstructor.feed(b2, &[0; 16]), Err(Error::BlockMismatch));
    }

    #[test]
    fn duplicate_is_ignored() {
        let mut reconstructor = BlockReconstructor::new(4);
        let b0 = BlockInfo::new(0, true, 4).unwrap();
        let b1 = BlockInfo::new(1, true, 4).unwrap();

        assert_eq!(reconstructor.feed(b0, &[0; 16]), Ok(BlockFeed::More));
        assert_eq!(reconstructor.feed(b1, &[0; 16]), Ok(BlockFeed::More));
        assert_eq!(reconstructor.feed(b1, &[0; 16]), Ok(BlockFeed::Duplicate));
        assert_eq!(reconstructor.len(), 32);
    }

    #[test]
    fn upsizing_is_rejected() {
        let mut reconstructor = BlockReconstructor::new(4);
        let b0 = BlockInfo::new(0, true, 4).unwrap();
        assert_eq!(reconstructor.feed(b0, &[0; 16]), Ok(BlockFeed::More));

        let bigger = BlockInfo::new(1, true, 5).unwrap();
        assert_eq!(
            reconstructor.feed(bigger, &[0; 32]),
            Err(Error::BlockMismatch)
        );
    }

    #[test]
    fn downsizing_is_allowed() {
        let mut reconstructor = BlockReconstructor::new(5);
        let b0 = BlockInfo::new(0, true, 5).unwrap();
        assert_eq!(reconstructor.feed(b0, &[0; 32]), Ok(BlockFeed::More));

        // The peer continues at szx=4; block 2 of 16 bytes is offset 32.
        let small = BlockInfo::new(2, false, 4).unwrap();
        assert_eq!(reconstructor.feed(small, &[0; 7]), Ok(BlockFeed::Finished));
        assert_eq!(reconstructor.into_payload().len(), 39);
    }

    #[test]
    fn short_non_final_block_is_rejected() {
        let mut reconstructor = BlockReconstructor::new(4);
        let b0 = BlockInfo::new(0, true, 4).unwrap();
        assert_eq!(
            reconstructor.feed(b0, &[0; 10]),
            Err(Error::BlockMismatch)
        );
    }

    #[test]
    fn segmenter_70000_bytes() {
        let payload: Vec<u8> = (0..70000u32).map(|i| i as u8).collect();
        let segmenter = BlockSegmenter::new(payload.clone(), 6).unwrap();

        assert_eq!(segmenter.block_count(), 69);

        let (b0, slice0) = segmenter.block_at(0).unwrap();
        assert!(b0.more_flag());
        assert_eq!(slice0.len(), 1024);

        let (b67, slice67) = segmenter.block_at(67).unwrap();
        assert!(b67.more_flag());
        assert_eq!(slice67.len(), 1024);

        let (b68, slice68) = segmenter.block_at(68).unwrap();
        assert!(!b68.more_flag());
        assert_eq!(slice68.len(), 70000 - 68 * 1024);

        assert_eq!(segmenter.block_at(69), None);

        // Feeding every block back through a reconstructor restores the
        // original payload.
        let mut reconstructor = BlockReconstructor::new(6);
        for num in 0..69 {
            let (info, slice) = segmenter.block_at(num).unwrap();
            reconstructor.feed(info, slice).unwrap();
        }
        assert!(reconstructor.is_finished());
        assert_eq!(reconstructor.into_payload(), payload);
    }

    #[test]
    fn segmenter_single_block() {
        let segmenter = BlockSegmenter::new(vec![1, 2, 3], 6).unwrap();
        assert!(segmenter.is_single_block());
        assert_eq!(segmenter.block_count(), 1);

        let (info, slice) = segmenter.block_at(0).unwrap();
        assert!(!info.more_flag());
        assert_eq!(slice, &[1, 2, 3]);
    }

    #[test]
    fn segmenter_served_at_smaller_szx() {
        let payload: Vec<u8> = (0..100u8).collect();
        let segmenter = BlockSegmenter::new(payload, 6).unwrap();

        let (info, slice) = segmenter.block_at_szx(1, 4).unwrap();
        assert_eq!(info.szx(), 4);
        assert_eq!(slice, &(16..32).collect::<Vec<u8>>()[..]);
    }
}
