use super::*;

/// Bundle processing control flag bits of interest (RFC 5050 section 4.2).
pub mod proc_flags {
    pub const IS_FRAGMENT: u64 = 0x01;
    pub const ADMIN_RECORD: u64 = 0x02;
    pub const DO_NOT_FRAGMENT: u64 = 0x04;
    pub const CUSTODY_REQUESTED: u64 = 0x08;
    pub const SINGLETON_DEST: u64 = 0x10;
    pub const ACK_BY_APP: u64 = 0x20;
}

/// The primary-block fields of a bundle.
///
/// A bundle on the wire is this primary block followed by zero or more
/// extension/security blocks and a terminal payload block; the block vector
/// itself travels separately as a [`BlockList`].
#[derive(Default, Clone, Debug)]
pub struct Bundle {
    pub source: Eid,
    pub dest: Eid,
    pub replyto: Eid,
    pub custodian: Eid,

    /// Bundle processing flags, the priority/class-of-service bits included.
    pub proc_flags: u64,

    pub creation_ts: u64,
    pub creation_seq: u64,
    pub lifetime: u64,

    pub is_fragment: bool,
    pub frag_offset: u64,
    pub orig_length: u64,

    /// The EID of the node this bundle most recently arrived from, used
    /// when defaulting BAB security endpoints. Null for locally sourced
    /// bundles.
    pub prevhop: Eid,
}

impl Bundle {
    /// Serialises a complete bundle: primary block bytes, then every block
    /// in vector order.
    ///
    /// All non-primary blocks must already be generated and complete; the
    /// dictionary in `blocks` must already contain every referenced EID
    /// (it is emitted inside the primary).
    pub fn serialize(&self, blocks: &BlockList) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for block in &blocks.blocks {
            if !block.complete() {
                return Err(Error::Unintelligible("incomplete block in bundle"));
            }
            out.extend_from_slice(block.contents());
        }
        Ok(out)
    }

    /// Parses a complete bundle image: the primary block, then blocks until
    /// one carries the LAST_BLOCK flag.
    ///
    /// Verifies the terminal-block invariant: exactly one block carries
    /// LAST_BLOCK and it is the last on the wire.
    pub fn parse(data: &[u8]) -> Result<(Bundle, BlockList), Error> {
        let (bundle, primary, dict, mut cursor) = primary::parse(data)?;

        let mut list = BlockList {
            dict,
            blocks: vec![primary],
        };

        let admin = bundle.proc_flags & proc_flags::ADMIN_RECORD != 0;
        loop {
            if cursor >= data.len() {
                return Err(Error::Unintelligible("bundle ends before last block"));
            }
            let mut block = BlockInfo::default();
            let consumed = block.consume(&data[cursor..])?;
            cursor += consumed;
            if !block.complete() {
                return Err(Error::Unintelligible("truncated block"));
            }
            if admin && block.flags() & block::flags::REPORT_ONERROR != 0 {
                return Err(Error::Unintelligible(
                    "administrative bundle block requests status reports",
                ));
            }
            block.resolve_eid_refs(&list.dict)?;
            let last = block.is_last_block();
            list.blocks.push(block);
            if last {
                break;
            }
        }

        if cursor != data.len() {
            return Err(Error::Unintelligible("trailing bytes after last block"));
        }
        Ok((bundle, list))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::flags;

    pub(crate) fn test_bundle() -> Bundle {
        Bundle {
            source: "dtn://a/app".parse().unwrap(),
            dest: "dtn://b/app".parse().unwrap(),
            replyto: Eid::Null,
            custodian: Eid::Null,
            proc_flags: proc_flags::SINGLETON_DEST,
            creation_ts: 410_000_000,
            creation_seq: 42,
            lifetime: 3600,
            ..Default::default()
        }
    }

    #[test]
    fn wire_round_trip() {
        let bundle = test_bundle();
        let mut list = BlockList::new();

        let mut payload = BlockInfo::new(BlockType::Payload);
        payload
            .generate_preamble(&mut list.dict, flags::LAST_BLOCK, 7)
            .unwrap();
        payload.append_data(b"ABCDEFG");

        let primary = primary::generate(&bundle, &mut list.dict).unwrap();
        list.blocks.push(primary);
        list.blocks.push(payload);

        let wire = bundle.serialize(&list).unwrap();
        let (parsed, parsed_list) = Bundle::parse(&wire).unwrap();

        assert_eq!(parsed.source, bundle.source);
        assert_eq!(parsed.dest, bundle.dest);
        assert_eq!(parsed.creation_ts, bundle.creation_ts);
        assert_eq!(parsed.creation_seq, bundle.creation_seq);
        assert_eq!(parsed.lifetime, bundle.lifetime);
        assert!(!parsed.is_fragment);
        assert_eq!(parsed_list.blocks.len(), 2);
        assert_eq!(parsed_list.blocks[1].data(), b"ABCDEFG");
        assert_eq!(bundle.serialize(&parsed_list).unwrap(), wire);
    }

    #[test]
    fn admin_bundle_must_not_request_block_reports() {
        let mut bundle = test_bundle();
        bundle.proc_flags |= proc_flags::ADMIN_RECORD;

        let mut list = BlockList::new();
        let mut payload = BlockInfo::new(BlockType::Payload);
        payload
            .generate_preamble(
                &mut list.dict,
                flags::LAST_BLOCK | flags::REPORT_ONERROR,
                3,
            )
            .unwrap();
        payload.append_data(b"adm");
        list.blocks
            .push(primary::generate(&bundle, &mut list.dict).unwrap());
        list.blocks.push(payload);

        let wire = bundle.serialize(&list).unwrap();
        assert!(Bundle::parse(&wire).is_err());
    }

    #[test]
    fn truncated_bundle_rejected() {
        let bundle = test_bundle();
        let mut list = BlockList::new();
        let mut payload = BlockInfo::new(BlockType::Payload);
        payload
            .generate_preamble(&mut list.dict, flags::LAST_BLOCK, 3)
            .unwrap();
        payload.append_data(b"xyz");
        list.blocks.push(primary::generate(&bundle, &mut list.dict).unwrap());
        list.blocks.push(payload);

        let wire = bundle.serialize(&list).unwrap();
        assert!(Bundle::parse(&wire[..wire.len() - 1]).is_err());
    }
}
