use super::*;

const BP_VERSION: u8 = 6;

/// Serialises the primary block (RFC 5050 section 4.5): version octet,
/// processing flags, block length, then the fixed SDNV fields, the
/// dictionary, and the fragment fields when present.
pub(crate) fn generate(bundle: &Bundle, dict: &mut Dictionary) -> Result<BlockInfo, Error> {
    let (dest_s, dest_p) = dict.add_eid(&bundle.dest);
    let (src_s, src_p) = dict.add_eid(&bundle.source);
    let (rep_s, rep_p) = dict.add_eid(&bundle.replyto);
    let (cust_s, cust_p) = dict.add_eid(&bundle.custodian);

    let mut body = Vec::new();
    for v in [dest_s, dest_p, src_s, src_p, rep_s, rep_p, cust_s, cust_p] {
        perigee_sdnv::encode_into(v, &mut body);
    }
    perigee_sdnv::encode_into(bundle.creation_ts, &mut body);
    perigee_sdnv::encode_into(bundle.creation_seq, &mut body);
    perigee_sdnv::encode_into(bundle.lifetime, &mut body);
    perigee_sdnv::encode_into(dict.raw().len() as u64, &mut body);
    body.extend_from_slice(dict.raw());
    if bundle.is_fragment {
        perigee_sdnv::encode_into(bundle.frag_offset, &mut body);
        perigee_sdnv::encode_into(bundle.orig_length, &mut body);
    }

    let mut flags = bundle.proc_flags;
    if bundle.is_fragment {
        flags |= bundle::proc_flags::IS_FRAGMENT;
    } else {
        flags &= !bundle::proc_flags::IS_FRAGMENT;
    }

    let mut contents = vec![BP_VERSION];
    perigee_sdnv::encode_into(flags, &mut contents);
    perigee_sdnv::encode_into(body.len() as u64, &mut contents);
    let data_offset = contents.len();
    contents.extend_from_slice(&body);

    let mut block = BlockInfo::new(BlockType::Primary);
    block.replace_contents(contents, data_offset);
    Ok(block)
}

/// Parses the primary block from the front of `data`, returning the bundle
/// fields, the primary's [`BlockInfo`], the bundle dictionary, and the
/// number of bytes consumed.
pub(crate) fn parse(data: &[u8]) -> Result<(Bundle, BlockInfo, Dictionary, usize), Error> {
    let mut cursor = 0;
    let version = *data
        .first()
        .ok_or(Error::Unintelligible("empty primary block"))?;
    if version != BP_VERSION {
        return Err(Error::InvalidVersion(version));
    }
    cursor += 1;

    let next = |cursor: &mut usize| -> Result<u64, Error> {
        let (value, n) = perigee_sdnv::decode(&data[*cursor..])?
            .ok_or(Error::Unintelligible("truncated primary block"))?;
        *cursor += n;
        Ok(value)
    };

    let proc_flags = next(&mut cursor)?;
    let block_len = next(&mut cursor)? as usize;
    let data_offset = cursor;
    let end = cursor
        .checked_add(block_len)
        .filter(|end| *end <= data.len())
        .ok_or(Error::Unintelligible("truncated primary block"))?;

    let mut offsets = [0u64; 8];
    for o in &mut offsets {
        *o = next(&mut cursor)?;
    }
    let creation_ts = next(&mut cursor)?;
    let creation_seq = next(&mut cursor)?;
    let lifetime = next(&mut cursor)?;

    let dict_len = next(&mut cursor)? as usize;
    if cursor + dict_len > end {
        return Err(Error::Unintelligible("dictionary overruns primary block"));
    }
    let dict = Dictionary::from_raw(&data[cursor..cursor + dict_len]);
    cursor += dict_len;

    let is_fragment = proc_flags & bundle::proc_flags::IS_FRAGMENT != 0;
    let (frag_offset, orig_length) = if is_fragment {
        (next(&mut cursor)?, next(&mut cursor)?)
    } else {
        (0, 0)
    };

    if cursor != end {
        return Err(Error::Unintelligible("primary block length mismatch"));
    }

    let bundle = Bundle {
        dest: dict.extract_eid(offsets[0], offsets[1])?,
        source: dict.extract_eid(offsets[2], offsets[3])?,
        replyto: dict.extract_eid(offsets[4], offsets[5])?,
        custodian: dict.extract_eid(offsets[6], offsets[7])?,
        proc_flags,
        creation_ts,
        creation_seq,
        lifetime,
        is_fragment,
        frag_offset,
        orig_length,
        prevhop: Eid::Null,
    };

    let mut block = BlockInfo::new(BlockType::Primary);
    block.replace_contents(data[..end].to_vec(), data_offset);
    Ok((bundle, block, dict, end))
}
