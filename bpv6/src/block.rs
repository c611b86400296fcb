/*!
The per-block wire codec.

Every block other than the primary shares one preamble shape:
`type(1) flags(SDNV) [eid-ref-count (scheme-off ssp-off)*]? data-length(SDNV)`
followed by exactly `data-length` content octets. Ingestion is
chunk-tolerant: bytes may arrive in arbitrary slices and a block accumulates
them until its preamble, and then its content, is complete.
*/

use super::*;

/// Block processing flag bits (RFC 5050 section 4.3).
pub mod flags {
    /// Block must be replicated in every fragment.
    pub const REPLICATE: u64 = 0x01;
    /// Transmit a status report if the block can't be processed.
    pub const REPORT_ONERROR: u64 = 0x02;
    /// Delete the bundle if the block can't be processed.
    pub const DISCARD_BUNDLE_ONERROR: u64 = 0x04;
    /// Last block in the bundle.
    pub const LAST_BLOCK: u64 = 0x08;
    /// Discard the block if it can't be processed.
    pub const DISCARD_BLOCK_ONERROR: u64 = 0x10;
    /// Block was forwarded without being processed.
    pub const FORWARDED_UNPROCESSED: u64 = 0x20;
    /// Block carries an EID-reference list.
    pub const EID_REFS: u64 = 0x40;
}

/// The type code of a bundle block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// The primary block. Never appears as a wire type byte; the value 0 is
    /// used internally to mark the head of a block vector.
    Primary,
    Payload,
    BundleAuthentication,
    PayloadIntegrity,
    Confidentiality,
    PreviousHop,
    Metadata,
    ExtensionSecurity,
    Unrecognised(u8),
}

impl From<u8> for BlockType {
    fn from(value: u8) -> Self {
        match value {
            0 => BlockType::Primary,
            1 => BlockType::Payload,
            2 => BlockType::BundleAuthentication,
            3 => BlockType::PayloadIntegrity,
            4 => BlockType::Confidentiality,
            5 => BlockType::PreviousHop,
            8 => BlockType::Metadata,
            9 => BlockType::ExtensionSecurity,
            v => BlockType::Unrecognised(v),
        }
    }
}

impl From<BlockType> for u8 {
    fn from(value: BlockType) -> Self {
        match value {
            BlockType::Primary => 0,
            BlockType::Payload => 1,
            BlockType::BundleAuthentication => 2,
            BlockType::PayloadIntegrity => 3,
            BlockType::Confidentiality => 4,
            BlockType::PreviousHop => 5,
            BlockType::Metadata => 8,
            BlockType::ExtensionSecurity => 9,
            BlockType::Unrecognised(v) => v,
        }
    }
}

/// One block of a bundle: its parsed preamble fields, its wire bytes, and
/// the security side-state attached to it.
///
/// `contents` holds the preamble octets followed by exactly `data_length`
/// content octets once the block is complete; `data_offset` is zero until
/// the preamble has been fully consumed.
#[derive(Default, Clone)]
pub struct BlockInfo {
    block_type: u8,
    flags: u64,
    eid_refs: Vec<(u64, u64)>,
    eid_list: Vec<Eid>,
    data_length: u64,
    data_offset: usize,
    contents: Vec<u8>,
    complete: bool,

    /// Per-ciphersuite state for security blocks.
    pub locals: Option<bsp::BspLocals>,
    /// Records of the security encapsulations this block arrived under.
    pub protection: Vec<metadata::ProtectionInfo>,
}

impl BlockInfo {
    pub fn new(block_type: BlockType) -> Self {
        Self {
            block_type: block_type.into(),
            ..Default::default()
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type.into()
    }

    /// Rewrites the type, both the field and the wire byte. Used when a
    /// block is replaced by its encrypted encapsulation.
    pub fn set_block_type(&mut self, block_type: BlockType) {
        self.block_type = block_type.into();
        if let Some(b) = self.contents.first_mut() {
            *b = self.block_type;
        }
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn is_last_block(&self) -> bool {
        self.flags & flags::LAST_BLOCK != 0
    }

    pub fn eid_refs(&self) -> &[(u64, u64)] {
        &self.eid_refs
    }

    pub fn eid_list(&self) -> &[Eid] {
        &self.eid_list
    }

    pub fn add_eid(&mut self, eid: Eid) {
        self.eid_list.push(eid);
    }

    pub fn set_eid_list(&mut self, eids: Vec<Eid>) {
        self.eid_list = eids;
    }

    /// Resolves the raw reference pairs of a received block against the
    /// bundle dictionary.
    pub fn resolve_eid_refs(&mut self, dict: &Dictionary) -> Result<(), Error> {
        self.eid_list = self
            .eid_refs
            .iter()
            .map(|(s, p)| dict.extract_eid(*s, *p))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn full_length(&self) -> usize {
        self.data_offset + self.data_length as usize
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// The content octets (everything after the preamble).
    pub fn data(&self) -> &[u8] {
        &self.contents[self.data_offset..]
    }

    /// Consumes preamble bytes from `buf`.
    ///
    /// Returns the number of bytes consumed on this call. While the
    /// preamble is still incomplete the whole of `buf` is absorbed into the
    /// scratch buffer and `buf.len()` is returned; once the final preamble
    /// field decodes, the scratch buffer is trimmed to exactly the preamble
    /// octets, `data_offset`/`data_length` are set, and only the bytes that
    /// belonged to the preamble are counted as consumed.
    pub fn consume_preamble(&mut self, buf: &[u8]) -> Result<usize, Error> {
        debug_assert_eq!(self.data_offset, 0);
        let prior = self.contents.len();
        self.contents.extend_from_slice(buf);

        let b = &self.contents;
        if b.is_empty() {
            return Ok(buf.len());
        }
        let mut cursor = 1;

        let Some((block_flags, n)) = perigee_sdnv::decode(&b[cursor..])? else {
            return Ok(buf.len());
        };
        cursor += n;

        let mut eid_refs = Vec::new();
        if block_flags & flags::EID_REFS != 0 {
            let Some((count, n)) = perigee_sdnv::decode(&b[cursor..])? else {
                return Ok(buf.len());
            };
            cursor += n;
            for _ in 0..count {
                let Some((scheme, n)) = perigee_sdnv::decode(&b[cursor..])? else {
                    return Ok(buf.len());
                };
                cursor += n;
                let Some((ssp, n)) = perigee_sdnv::decode(&b[cursor..])? else {
                    return Ok(buf.len());
                };
                cursor += n;
                eid_refs.push((scheme, ssp));
            }
        }

        let Some((data_length, n)) = perigee_sdnv::decode(&b[cursor..])? else {
            return Ok(buf.len());
        };
        cursor += n;

        if data_length > u32::MAX as u64 {
            return Err(Error::DataTooLong(data_length));
        }

        self.block_type = self.contents[0];
        self.flags = block_flags;
        self.eid_refs = eid_refs;
        self.data_length = data_length;
        self.data_offset = cursor;
        self.contents.truncate(cursor);
        Ok(cursor - prior)
    }

    /// Drives full block ingestion from `buf`: completes the preamble, then
    /// appends up to `data_length` content octets, marking the block
    /// complete when `contents.len() == full_length()`. Returns the total
    /// bytes consumed on this call.
    pub fn consume(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let mut consumed = 0;
        if self.data_offset == 0 {
            consumed = self.consume_preamble(buf)?;
            if self.data_offset == 0 {
                return Ok(consumed);
            }
            self.contents.reserve(self.data_length as usize);
            if self.data_length == 0 {
                self.complete = true;
                return Ok(consumed);
            }
        }

        let want = self.full_length() - self.contents.len();
        let take = want.min(buf.len() - consumed);
        self.contents
            .extend_from_slice(&buf[consumed..consumed + take]);
        consumed += take;

        if self.contents.len() == self.full_length() {
            self.complete = true;
        }
        Ok(consumed)
    }

    /// Writes the preamble for transmission.
    ///
    /// Dictionary offsets are computed for every EID in the block's EID
    /// list (appending to the bundle-wide dictionary as needed) and the
    /// `EID_REFS` flag is set iff the list is non-empty. `LAST_BLOCK` is
    /// the caller's responsibility, based on position.
    pub fn generate_preamble(
        &mut self,
        dict: &mut Dictionary,
        block_flags: u64,
        data_length: u64,
    ) -> Result<(), Error> {
        if data_length > u32::MAX as u64 {
            return Err(Error::DataTooLong(data_length));
        }

        let refs: Vec<(u64, u64)> = self.eid_list.iter().map(|eid| dict.add_eid(eid)).collect();
        let block_flags = if refs.is_empty() {
            block_flags & !flags::EID_REFS
        } else {
            block_flags | flags::EID_REFS
        };

        let mut buf = Vec::new();
        buf.push(self.block_type);
        perigee_sdnv::encode_into(block_flags, &mut buf);
        if !refs.is_empty() {
            perigee_sdnv::encode_into(refs.len() as u64, &mut buf);
            for (scheme, ssp) in &refs {
                perigee_sdnv::encode_into(*scheme, &mut buf);
                perigee_sdnv::encode_into(*ssp, &mut buf);
            }
        }
        perigee_sdnv::encode_into(data_length, &mut buf);

        self.flags = block_flags;
        self.eid_refs = refs;
        self.data_length = data_length;
        self.data_offset = buf.len();
        self.complete = data_length == 0;
        self.contents = buf;
        Ok(())
    }

    /// Rewrites the preamble in place with a new flag value, preserving the
    /// EID-reference list, the data length, and the content octets. Used to
    /// settle the LAST_BLOCK bit once final block positions are known.
    pub fn rewrite_flags(&mut self, block_flags: u64) {
        let mut buf = Vec::with_capacity(self.contents.len());
        buf.push(self.block_type);
        perigee_sdnv::encode_into(block_flags, &mut buf);
        if block_flags & flags::EID_REFS != 0 {
            perigee_sdnv::encode_into(self.eid_refs.len() as u64, &mut buf);
            for (scheme, ssp) in &self.eid_refs {
                perigee_sdnv::encode_into(*scheme, &mut buf);
                perigee_sdnv::encode_into(*ssp, &mut buf);
            }
        }
        perigee_sdnv::encode_into(self.data_length, &mut buf);
        let data_offset = buf.len();
        buf.extend_from_slice(&self.contents[self.data_offset..]);
        self.flags = block_flags;
        self.data_offset = data_offset;
        self.contents = buf;
    }

    /// Appends content octets after a generated preamble.
    pub fn append_data(&mut self, data: &[u8]) {
        debug_assert!(self.data_offset != 0);
        debug_assert!(self.contents.len() + data.len() <= self.full_length());
        self.contents.extend_from_slice(data);
        if self.contents.len() == self.full_length() {
            self.complete = true;
        }
    }

    /// Streams `len` octets starting at `offset` through `f` read-only.
    pub fn process(
        &self,
        offset: usize,
        len: usize,
        mut f: impl FnMut(&[u8]),
    ) -> Result<(), Error> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.contents.len())
            .ok_or(Error::Unintelligible("block range out of bounds"))?;
        f(&self.contents[offset..end]);
        Ok(())
    }

    /// Edits `len` octets starting at `offset` in place.
    pub fn mutate(
        &mut self,
        offset: usize,
        len: usize,
        mut f: impl FnMut(&mut [u8]),
    ) -> Result<(), Error> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.contents.len())
            .ok_or(Error::Unintelligible("block range out of bounds"))?;
        f(&mut self.contents[offset..end]);
        Ok(())
    }

    /// Direct access for back-patching reserved result space.
    pub(crate) fn contents_mut(&mut self) -> &mut Vec<u8> {
        &mut self.contents
    }

    pub(crate) fn replace_contents(&mut self, contents: Vec<u8>, data_offset: usize) {
        self.data_length = (contents.len() - data_offset) as u64;
        self.data_offset = data_offset;
        self.complete = true;
        self.contents = contents;
    }
}

/// A direction's ordered block vector and its shared dictionary.
#[derive(Default)]
pub struct BlockList {
    pub dict: Dictionary,
    pub blocks: Vec<BlockInfo>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, block_type: BlockType) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.block_type() == block_type)
    }

    /// The insertion point just after the primary block.
    pub fn position_after_primary(&self) -> usize {
        match self.blocks.first() {
            Some(b) if b.block_type() == BlockType::Primary => 1,
            _ => 0,
        }
    }

    /// The insertion point after the primary and any leading BAB block.
    pub fn position_after_bab(&self) -> usize {
        let mut pos = self.position_after_primary();
        while self
            .blocks
            .get(pos)
            .is_some_and(|b| b.block_type() == BlockType::BundleAuthentication)
        {
            pos += 1;
        }
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(data: &[u8]) -> (Dictionary, BlockInfo) {
        let mut dict = Dictionary::new();
        let mut block = BlockInfo::new(BlockType::Metadata);
        block.add_eid("dtn://sec-src/".parse().unwrap());
        block.add_eid("dtn://sec-dest/".parse().unwrap());
        block
            .generate_preamble(&mut dict, flags::REPORT_ONERROR, data.len() as u64)
            .unwrap();
        block.append_data(data);
        (dict, block)
    }

    #[test]
    fn preamble_round_trip() {
        let (dict, block) = sample_block(b"hello block");
        assert!(block.complete());

        let mut parsed = BlockInfo::default();
        let consumed = parsed.consume(block.contents()).unwrap();
        assert_eq!(consumed, block.contents().len());
        assert!(parsed.complete());

        assert_eq!(parsed.block_type(), BlockType::Metadata);
        assert_eq!(
            parsed.flags(),
            flags::REPORT_ONERROR | flags::EID_REFS
        );
        assert_eq!(parsed.data_length(), 11);
        assert_eq!(parsed.data_offset(), block.data_offset());
        assert_eq!(parsed.data(), b"hello block");

        let mut parsed = parsed;
        parsed.resolve_eid_refs(&dict).unwrap();
        assert_eq!(parsed.eid_list(), block.eid_list());
    }

    #[test]
    fn chunk_tolerant_consume() {
        let (_, block) = sample_block(b"chunked content bytes");
        let wire = block.contents();

        // Every split point, byte by byte, yields the same block
        for chunk_len in 1..wire.len() {
            let mut parsed = BlockInfo::default();
            let mut fed = 0;
            while fed < wire.len() {
                let end = (fed + chunk_len).min(wire.len());
                let consumed = parsed.consume(&wire[fed..end]).unwrap();
                assert_eq!(consumed, end - fed);
                fed = end;
            }
            assert!(parsed.complete());
            assert_eq!(parsed.contents(), wire);
            assert_eq!(parsed.data_offset(), block.data_offset());
        }
    }

    #[test]
    fn zero_length_block_completes_on_preamble() {
        let mut dict = Dictionary::new();
        let mut block = BlockInfo::new(BlockType::Payload);
        block
            .generate_preamble(&mut dict, flags::LAST_BLOCK, 0)
            .unwrap();
        assert!(block.complete());

        let mut parsed = BlockInfo::default();
        let consumed = parsed.consume(block.contents()).unwrap();
        assert_eq!(consumed, block.contents().len());
        assert!(parsed.complete());
        assert!(parsed.is_last_block());
    }

    #[test]
    fn preamble_consumed_count_excludes_data() {
        let (_, block) = sample_block(b"xyz");
        let wire = block.contents();

        // Whole wire image in one call: consume_preamble absorbs everything
        // but only counts the preamble octets.
        let mut parsed = BlockInfo::default();
        let consumed = parsed.consume_preamble(wire).unwrap();
        assert_eq!(consumed, block.data_offset());
        assert_eq!(parsed.contents().len(), block.data_offset());
    }

    #[test]
    fn oversized_data_length_rejected() {
        let mut wire = vec![1u8, 0];
        perigee_sdnv::encode_into(u32::MAX as u64 + 1, &mut wire);
        let mut parsed = BlockInfo::default();
        assert!(matches!(
            parsed.consume(&wire),
            Err(Error::DataTooLong(_))
        ));
    }
}
