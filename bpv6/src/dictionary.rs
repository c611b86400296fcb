use super::*;

/// The compressed endpoint-ID string table carried in the primary block.
///
/// Scheme and SSP strings are stored NUL-terminated, back to back, and
/// referenced by byte offset from the other blocks' EID-reference lists.
/// The table is append-only, so offsets are stable for its whole lifetime:
/// one dictionary exists per receive-direction block vector and one per
/// transmit-direction block vector.
#[derive(Default, Clone)]
pub struct Dictionary {
    raw: Vec<u8>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a dictionary from the raw bytes of a received primary block.
    pub fn from_raw(raw: &[u8]) -> Self {
        Self { raw: raw.to_vec() }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Inserts `s` if not already present and returns its byte offset.
    pub fn add_str(&mut self, s: &str) -> u64 {
        if let Some(offset) = self.find(s) {
            return offset;
        }
        let offset = self.raw.len() as u64;
        self.raw.extend_from_slice(s.as_bytes());
        self.raw.push(0);
        offset
    }

    /// Inserts the scheme and SSP of `eid` if new, returning their offsets.
    pub fn add_eid(&mut self, eid: &Eid) -> (u64, u64) {
        (self.add_str(eid.scheme()), self.add_str(eid.ssp()))
    }

    /// Returns the offsets of an EID already in the dictionary.
    pub fn get_offsets(&self, eid: &Eid) -> Result<(u64, u64), Error> {
        match (self.find(eid.scheme()), self.find(eid.ssp())) {
            (Some(s), Some(p)) => Ok((s, p)),
            _ => Err(Error::Unintelligible("EID not in dictionary")),
        }
    }

    /// The NUL-terminated string starting at `offset`.
    pub fn str_at(&self, offset: u64) -> Result<&str, Error> {
        let start = usize::try_from(offset).map_err(|_| Error::BadDictionaryOffset(offset))?;
        if start >= self.raw.len() {
            return Err(Error::BadDictionaryOffset(offset));
        }
        let end = self.raw[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|n| start + n)
            .ok_or(Error::BadDictionaryOffset(offset))?;
        std::str::from_utf8(&self.raw[start..end])
            .map_err(|_| Error::Unintelligible("dictionary string is not UTF-8"))
    }

    /// Reconstructs an EID from a (scheme, SSP) offset pair.
    pub fn extract_eid(&self, scheme_offset: u64, ssp_offset: u64) -> Result<Eid, Error> {
        Ok(Eid::new(self.str_at(scheme_offset)?, self.str_at(ssp_offset)?))
    }

    fn find(&self, s: &str) -> Option<u64> {
        let mut offset = 0;
        while offset < self.raw.len() {
            let end = offset + self.raw[offset..].iter().position(|&b| b == 0)?;
            if &self.raw[offset..end] == s.as_bytes() {
                return Some(offset as u64);
            }
            offset = end + 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_stable_and_deduplicated() {
        let mut dict = Dictionary::new();
        let a: Eid = "dtn://a/app".parse().unwrap();
        let b: Eid = "dtn://b".parse().unwrap();

        let (a_scheme, a_ssp) = dict.add_eid(&a);
        let (b_scheme, b_ssp) = dict.add_eid(&b);

        // Shared scheme string is stored once
        assert_eq!(a_scheme, b_scheme);
        assert_ne!(a_ssp, b_ssp);

        // Re-adding changes nothing
        assert_eq!(dict.add_eid(&a), (a_scheme, a_ssp));
        assert_eq!(dict.get_offsets(&b).unwrap(), (b_scheme, b_ssp));

        assert_eq!(dict.extract_eid(a_scheme, a_ssp).unwrap(), a);
        assert_eq!(dict.extract_eid(b_scheme, b_ssp).unwrap(), b);
    }

    #[test]
    fn survives_raw_round_trip() {
        let mut dict = Dictionary::new();
        let eid: Eid = "dtn://node/x".parse().unwrap();
        let offsets = dict.add_eid(&eid);

        let rebuilt = Dictionary::from_raw(dict.raw());
        assert_eq!(rebuilt.extract_eid(offsets.0, offsets.1).unwrap(), eid);
    }

    #[test]
    fn bad_offsets_rejected() {
        let dict = Dictionary::from_raw(b"dtn\0//a\0");
        assert!(dict.str_at(100).is_err());
        assert!(dict.extract_eid(0, 4).is_ok());
    }
}
