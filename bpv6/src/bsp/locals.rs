use super::*;

/// Tags for entries in the security-parameters and security-result fields.
pub mod tags {
    pub const IV: u8 = 1;
    pub const KEY_INFO: u8 = 3;
    pub const FRAGMENT: u8 = 4;
    pub const SIGNATURE: u8 = 5;
    pub const SALT: u8 = 7;
    pub const ICV: u8 = 8;
    pub const ENCAP_BLOCK: u8 = 10;
}

/// Abstract-security-block flag bits.
pub mod cs_flags {
    pub const HAS_SOURCE: u64 = 0x10;
    pub const HAS_DEST: u64 = 0x08;
    pub const HAS_PARAMS: u64 = 0x04;
    pub const HAS_CORRELATOR: u64 = 0x02;
    pub const HAS_RESULT: u64 = 0x01;
}

/// Per-block ciphersuite state: the parsed (or to-be-serialised) abstract
/// security block, plus bookkeeping that never reaches the wire.
///
/// The wire form of a security block's content is
/// `csnum(SDNV) flags(SDNV) [correlator(SDNV)]? [params-len(SDNV) params]?
/// [result-len(SDNV) result]?` where params and result are sequences of
/// `{tag(1) len(SDNV) value}` entries.
#[derive(Default, Clone, Debug)]
pub struct BspLocals {
    pub csnum: u64,
    pub cs_flags: u64,
    pub correlator: Option<u64>,
    pub security_src: Option<Eid>,
    pub security_dest: Option<Eid>,

    /// Position within a correlated family: 0 for the block that drives the
    /// ciphersuite, 1.. for members. Never serialised.
    pub correlator_seq: u16,

    /// The content-encryption key a confidentiality suite generated during
    /// `generate`, held for `finalize`. Never serialised.
    pub(crate) session_key: Option<zeroize::Zeroizing<Vec<u8>>>,

    params: Vec<(u8, Vec<u8>)>,
    results: Vec<(u8, Vec<u8>)>,
    result_hole: usize,
}

fn entries_len(entries: &[(u8, Vec<u8>)]) -> usize {
    entries
        .iter()
        .map(|(_, v)| 1 + perigee_sdnv::encoding_len(v.len() as u64) + v.len())
        .sum()
}

fn write_entries(entries: &[(u8, Vec<u8>)], out: &mut Vec<u8>) {
    for (tag, value) in entries {
        out.push(*tag);
        perigee_sdnv::encode_into(value.len() as u64, out);
        out.extend_from_slice(value);
    }
}

fn parse_entries(data: &[u8]) -> Result<Vec<(u8, Vec<u8>)>, Error> {
    let mut entries = Vec::new();
    let mut cursor = 0;
    while cursor < data.len() {
        let tag = data[cursor];
        cursor += 1;
        let (len, n) = perigee_sdnv::decode(&data[cursor..])
            .map_err(|_| Error::Malformed("bad entry length"))?
            .ok_or(Error::Malformed("truncated entry length"))?;
        cursor += n;
        let len = len as usize;
        if cursor + len > data.len() {
            return Err(Error::Malformed("entry value overruns field"));
        }
        entries.push((tag, data[cursor..cursor + len].to_vec()));
        cursor += len;
    }
    Ok(entries)
}

impl BspLocals {
    pub fn new(csnum: u64) -> Self {
        Self {
            csnum,
            ..Default::default()
        }
    }

    pub fn set_correlator(&mut self, correlator: u64) {
        self.correlator = Some(correlator);
        self.cs_flags |= cs_flags::HAS_CORRELATOR;
    }

    pub fn set_security_src(&mut self, eid: Eid) {
        self.security_src = Some(eid);
        self.cs_flags |= cs_flags::HAS_SOURCE;
    }

    pub fn set_security_dest(&mut self, eid: Eid) {
        self.security_dest = Some(eid);
        self.cs_flags |= cs_flags::HAS_DEST;
    }

    pub fn add_param(&mut self, tag: u8, value: &[u8]) {
        self.params.push((tag, value.to_vec()));
        self.cs_flags |= cs_flags::HAS_PARAMS;
    }

    pub fn get_param(&self, tag: u8) -> Option<&[u8]> {
        self.params
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    pub fn add_result(&mut self, tag: u8, value: &[u8]) {
        self.results.push((tag, value.to_vec()));
        self.cs_flags |= cs_flags::HAS_RESULT;
    }

    pub fn get_result(&self, tag: u8) -> Option<&[u8]> {
        self.results
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    /// Reserves space in the serialised result field for a value of
    /// `value_len` bytes under `tag`, to be filled in by a later
    /// [`patch_result`](Self::patch_result). The hole covers the whole
    /// entry: tag octet, length SDNV and value.
    pub fn add_result_space(&mut self, value_len: usize) {
        self.result_hole = 1 + perigee_sdnv::encoding_len(value_len as u64) + value_len;
        self.cs_flags |= cs_flags::HAS_RESULT;
    }

    /// Drops all results and any reserved hole, clearing the flag, so a
    /// ciphersuite can rebuild the result field between callbacks.
    pub fn reset_results(&mut self) {
        self.results.clear();
        self.result_hole = 0;
        self.cs_flags &= !cs_flags::HAS_RESULT;
    }

    pub fn params_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_entries(&self.params, &mut out);
        out
    }

    /// The serialised result-field length, the reserved hole included.
    pub fn results_len(&self) -> usize {
        entries_len(&self.results) + self.result_hole
    }

    /// Serialises the block content: everything after the block preamble.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        perigee_sdnv::encode_into(self.csnum, &mut out);
        perigee_sdnv::encode_into(self.cs_flags, &mut out);
        if let Some(correlator) = self.correlator {
            perigee_sdnv::encode_into(correlator, &mut out);
        }
        if self.cs_flags & cs_flags::HAS_PARAMS != 0 {
            let params = self.params_bytes();
            perigee_sdnv::encode_into(params.len() as u64, &mut out);
            out.extend_from_slice(&params);
        }
        if self.cs_flags & cs_flags::HAS_RESULT != 0 {
            perigee_sdnv::encode_into(self.results_len() as u64, &mut out);
            write_entries(&self.results, &mut out);
            out.resize(out.len() + self.result_hole, 0);
        }
        out
    }

    /// Parses the block content of a received security block and assigns
    /// the security source/destination from the block's EID list.
    pub fn parse_block(block: &BlockInfo) -> Result<Self, Error> {
        let data = block.data();
        let mut cursor = 0;
        let next = |cursor: &mut usize| -> Result<u64, Error> {
            let (value, n) = perigee_sdnv::decode(&data[*cursor..])
                .map_err(|_| Error::Malformed("bad SDNV in security block"))?
                .ok_or(Error::Malformed("truncated security block"))?;
            *cursor += n;
            Ok(value)
        };

        let mut locals = BspLocals::new(next(&mut cursor)?);
        locals.cs_flags = next(&mut cursor)?;

        if locals.cs_flags & cs_flags::HAS_CORRELATOR != 0 {
            locals.correlator = Some(next(&mut cursor)?);
        }
        if locals.cs_flags & cs_flags::HAS_PARAMS != 0 {
            let len = next(&mut cursor)? as usize;
            if cursor + len > data.len() {
                return Err(Error::Malformed("parameter field overruns block"));
            }
            locals.params = parse_entries(&data[cursor..cursor + len])?;
            cursor += len;
        }
        if locals.cs_flags & cs_flags::HAS_RESULT != 0 {
            let len = next(&mut cursor)? as usize;
            if cursor + len > data.len() {
                return Err(Error::Malformed("result field overruns block"));
            }
            locals.results = parse_entries(&data[cursor..cursor + len])?;
            cursor += len;
        }
        if cursor != data.len() {
            return Err(Error::Malformed("trailing bytes in security block"));
        }

        let mut eids = block.eid_list().iter();
        if locals.cs_flags & cs_flags::HAS_SOURCE != 0 {
            locals.security_src = Some(
                eids.next()
                    .cloned()
                    .ok_or(Error::Malformed("missing security-source EID ref"))?,
            );
        }
        if locals.cs_flags & cs_flags::HAS_DEST != 0 {
            locals.security_dest = Some(
                eids.next()
                    .cloned()
                    .ok_or(Error::Malformed("missing security-destination EID ref"))?,
            );
        }
        Ok(locals)
    }

    /// The offset within the block content where the result-length SDNV
    /// begins, or `None` if the block carries no result. Used to bound
    /// digest coverage of result-bearing blocks.
    pub fn result_field_offset(data: &[u8]) -> Result<Option<usize>, Error> {
        let mut cursor = 0;
        let next = |cursor: &mut usize| -> Result<u64, Error> {
            let (value, n) = perigee_sdnv::decode(&data[*cursor..])
                .map_err(|_| Error::Malformed("bad SDNV in security block"))?
                .ok_or(Error::Malformed("truncated security block"))?;
            *cursor += n;
            Ok(value)
        };

        next(&mut cursor)?; // csnum
        let flags = next(&mut cursor)?;
        if flags & cs_flags::HAS_RESULT == 0 {
            return Ok(None);
        }
        if flags & cs_flags::HAS_CORRELATOR != 0 {
            next(&mut cursor)?;
        }
        if flags & cs_flags::HAS_PARAMS != 0 {
            let len = next(&mut cursor)? as usize;
            cursor = cursor
                .checked_add(len)
                .filter(|c| *c <= data.len())
                .ok_or(Error::Malformed("parameter field overruns block"))?;
        }
        Ok(Some(cursor))
    }

    /// Fills a value into the hole left by
    /// [`add_result_space`](Self::add_result_space). The hole sits at the
    /// very end of the block's serialised content.
    pub fn patch_result(&mut self, block: &mut BlockInfo, tag: u8, value: &[u8]) -> Result<(), Error> {
        let mut entry = vec![tag];
        perigee_sdnv::encode_into(value.len() as u64, &mut entry);
        entry.extend_from_slice(value);
        if entry.len() != self.result_hole {
            return Err(Error::Malformed("security result does not fit its hole"));
        }
        let contents = block.contents_mut();
        let at = contents.len() - entry.len();
        contents[at..].copy_from_slice(&entry);

        self.results.push((tag, value.to_vec()));
        self.result_hole = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::flags;

    #[test]
    fn serialize_parse_round_trip() {
        let mut locals = BspLocals::new(3);
        locals.set_correlator(0x0003_0001);
        locals.set_security_src("dtn://a/".parse().unwrap());
        locals.set_security_dest("dtn://b/".parse().unwrap());
        locals.add_param(tags::SALT, &[0, 1, 2, 3]);
        locals.add_param(tags::IV, &[9; 8]);
        locals.add_result(tags::ICV, &[7; 16]);

        let data = locals.serialize();
        let mut dict = Dictionary::new();
        let mut block = BlockInfo::new(BlockType::Confidentiality);
        block.add_eid("dtn://a/".parse().unwrap());
        block.add_eid("dtn://b/".parse().unwrap());
        block
            .generate_preamble(&mut dict, 0, data.len() as u64)
            .unwrap();
        block.append_data(&data);

        let parsed = BspLocals::parse_block(&block).unwrap();
        assert_eq!(parsed.csnum, 3);
        assert_eq!(parsed.cs_flags, locals.cs_flags);
        assert_eq!(parsed.correlator, Some(0x0003_0001));
        assert_eq!(parsed.security_src, locals.security_src);
        assert_eq!(parsed.security_dest, locals.security_dest);
        assert_eq!(parsed.get_param(tags::SALT), Some(&[0u8, 1, 2, 3][..]));
        assert_eq!(parsed.get_param(tags::IV), Some(&[9u8; 8][..]));
        assert_eq!(parsed.get_result(tags::ICV), Some(&[7u8; 16][..]));
    }

    #[test]
    fn result_hole_patched_in_place() {
        let mut locals = BspLocals::new(5);
        locals.set_correlator(0x0005_0000);
        locals.add_result_space(32);

        let data = locals.serialize();
        let mut dict = Dictionary::new();
        let mut block = BlockInfo::new(BlockType::BundleAuthentication);
        block
            .generate_preamble(&mut dict, flags::LAST_BLOCK, data.len() as u64)
            .unwrap();
        block.append_data(&data);

        let mac = [0xAB; 32];
        locals.patch_result(&mut block, tags::SIGNATURE, &mac).unwrap();

        let parsed = BspLocals::parse_block(&block).unwrap();
        assert_eq!(parsed.get_result(tags::SIGNATURE), Some(&mac[..]));

        // Serialised length was unchanged by the patch
        assert_eq!(block.data_length() as usize, data.len());
    }

    #[test]
    fn result_field_offset_bounds_digest() {
        let mut locals = BspLocals::new(1);
        locals.set_correlator(0x0001_0000);
        locals.add_result(tags::SIGNATURE, &[0; 20]);
        let data = locals.serialize();

        let offset = BspLocals::result_field_offset(&data).unwrap().unwrap();
        // Everything before the offset is csnum + flags + correlator
        let mut expect = Vec::new();
        perigee_sdnv::encode_into(1, &mut expect);
        perigee_sdnv::encode_into(
            cs_flags::HAS_CORRELATOR | cs_flags::HAS_RESULT,
            &mut expect,
        );
        perigee_sdnv::encode_into(0x0001_0000, &mut expect);
        assert_eq!(offset, expect.len());
        assert_eq!(&data[..offset], &expect[..]);
    }
}
