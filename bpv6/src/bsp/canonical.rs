//! Mutable canonicalization: the deterministic byte stream over which
//! signatures and MACs are computed, with per-hop mutable fields masked.
//!
//! The canonical form is emitted incrementally into a caller-supplied sink
//! rather than materialised, so payload content can be streamed through the
//! block visitor without copying.

use super::*;

/// Primary-block flag bits that survive canonicalization.
pub(crate) const PRIMARY_MASK: u64 = 0x0007_C1BE;

/// Extension-block flag bits that survive canonicalization.
pub(crate) const EXTENSION_MASK: u64 = 0x57;

/// Emits the canonical form of the primary block from the parsed bundle
/// fields: version octet, masked flags as eight big-endian octets, a
/// 32-bit logical header length, then for each of destination, source and
/// report-to the combined string length and the scheme and SSP strings,
/// then timestamp, sequence and lifetime as eight-octet words, and the
/// fragment fields when the bundle is a fragment.
pub(crate) fn primary(bundle: &Bundle, sink: &mut impl FnMut(&[u8])) {
    let eids = [&bundle.dest, &bundle.source, &bundle.replyto];

    let mut header_len: u32 = 1 + 8 + 4 + (3 * 4) + 8 + 8 + 8;
    if bundle.is_fragment {
        header_len += 8 + 8;
    }
    for eid in eids {
        header_len += (eid.scheme().len() + eid.ssp().len()) as u32;
    }

    sink(&[6]);
    sink(&(bundle.proc_flags & PRIMARY_MASK).to_be_bytes());
    sink(&header_len.to_be_bytes());

    for eid in eids {
        let combined = (eid.scheme().len() + eid.ssp().len()) as u32;
        sink(&combined.to_be_bytes());
        sink(eid.scheme().as_bytes());
        sink(eid.ssp().as_bytes());
    }

    sink(&bundle.creation_ts.to_be_bytes());
    sink(&bundle.creation_seq.to_be_bytes());
    sink(&bundle.lifetime.to_be_bytes());

    if bundle.is_fragment {
        sink(&bundle.frag_offset.to_be_bytes());
        sink(&bundle.orig_length.to_be_bytes());
    }
}

/// Emits the canonical form of a non-primary block (the payload included).
///
/// The preamble contributes the type octet, the masked flags as eight
/// big-endian octets, and, in place of raw reference offsets, the
/// dictionary strings each EID reference points at. The content length is
/// an eight-octet word; for the security block being computed it is only
/// emitted under CS#2. Content follows: the raw octets for every block
/// other than the one being computed, and for that block its abstract
/// security fields up to, but excluding, the security result — whose
/// length SDNV is again a CS#2-only inclusion.
pub(crate) fn block(
    list: &BlockList,
    idx: usize,
    is_self: bool,
    csnum: u64,
    sink: &mut impl FnMut(&[u8]),
) -> Result<(), Error> {
    let block = &list.blocks[idx];

    sink(&[u8::from(block.block_type())]);
    sink(&(block.flags() & EXTENSION_MASK).to_be_bytes());

    if block.flags() & block::flags::EID_REFS != 0 {
        for (scheme, ssp) in block.eid_refs() {
            for offset in [scheme, ssp] {
                sink(
                    list.dict
                        .str_at(*offset)
                        .map_err(|_| Error::Malformed("unresolvable EID reference"))?
                        .as_bytes(),
                );
            }
        }
    }

    if !is_self || csnum == 2 {
        sink(&block.data_length().to_be_bytes());
    }

    if !is_self {
        block
            .process(block.data_offset(), block.data_length() as usize, |d| {
                sink(d)
            })
            .map_err(|_| Error::Malformed("short block content"))?;
        return Ok(());
    }

    let locals = block
        .locals
        .as_ref()
        .ok_or(Error::Malformed("security block without locals"))?;

    let mut tmp = Vec::new();
    perigee_sdnv::encode_into(locals.csnum, &mut tmp);
    perigee_sdnv::encode_into(locals.cs_flags, &mut tmp);
    if let Some(correlator) = locals.correlator {
        perigee_sdnv::encode_into(correlator, &mut tmp);
    }
    if locals.cs_flags & cs_flags::HAS_PARAMS != 0 {
        let params = locals.params_bytes();
        perigee_sdnv::encode_into(params.len() as u64, &mut tmp);
        tmp.extend_from_slice(&params);
    }
    if csnum == 2 && locals.cs_flags & cs_flags::HAS_RESULT != 0 {
        perigee_sdnv::encode_into(locals.results_len() as u64, &mut tmp);
    }
    sink(&tmp);
    Ok(())
}
