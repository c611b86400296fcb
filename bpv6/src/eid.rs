use super::*;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An error related to endpoint-ID processing.
#[derive(Error, Debug)]
pub enum EidError {
    #[error("EID '{0}' has no scheme separator")]
    MissingSeparator(String),

    #[error("EID scheme is empty")]
    EmptyScheme,

    #[error("EID is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
}

/// An RFC 5050 endpoint ID: a scheme name and a scheme-specific part.
///
/// The null EID `dtn:none` is a distinguished sentinel.
#[derive(Default, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Eid {
    #[default]
    Null,
    Uri {
        scheme: String,
        ssp: String,
    },
}

impl Eid {
    pub fn new(scheme: &str, ssp: &str) -> Self {
        if scheme == "dtn" && ssp == "none" {
            Eid::Null
        } else {
            Eid::Uri {
                scheme: scheme.to_string(),
                ssp: ssp.to_string(),
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Eid::Null)
    }

    pub fn scheme(&self) -> &str {
        match self {
            Eid::Null => "dtn",
            Eid::Uri { scheme, .. } => scheme,
        }
    }

    pub fn ssp(&self) -> &str {
        match self {
            Eid::Null => "none",
            Eid::Uri { ssp, .. } => ssp,
        }
    }

    /// The authority part of a `scheme://host/...` SSP, used for key store
    /// lookup. EIDs without an authority yield the whole SSP.
    pub fn host(&self) -> &str {
        let ssp = self.ssp();
        match ssp.strip_prefix("//") {
            Some(rest) => rest.split('/').next().unwrap_or(rest),
            None => ssp,
        }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme(), self.ssp())
    }
}

impl fmt::Debug for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Eid {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, ssp) = s
            .split_once(':')
            .ok_or_else(|| EidError::MissingSeparator(s.to_string()))?;
        if scheme.is_empty() {
            return Err(EidError::EmptyScheme);
        }
        Ok(Eid::new(scheme, ssp))
    }
}

/// A pattern over endpoint IDs.
///
/// Patterns come in four shapes: the null pattern (unconstrained, meaning
/// "default this endpoint"), the universal wildcard `*`, a prefix pattern
/// `scheme://authority/*`, and an exact EID.
#[derive(Default, Clone, PartialEq, Eq)]
pub enum EidPattern {
    /// Matches everything and signals "use the contextual default".
    #[default]
    Null,
    /// Matches everything.
    Any,
    /// Matches EIDs whose string form starts with the prefix.
    Prefix(String),
    /// Matches exactly one EID.
    Exact(Eid),
}

impl EidPattern {
    pub fn is_null(&self) -> bool {
        matches!(self, EidPattern::Null)
    }

    pub fn matches(&self, eid: &Eid) -> bool {
        match self {
            EidPattern::Null | EidPattern::Any => true,
            EidPattern::Prefix(prefix) => eid.to_string().starts_with(prefix),
            EidPattern::Exact(e) => e == eid,
        }
    }
}

impl fmt::Display for EidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EidPattern::Null => f.write_str("<default>"),
            EidPattern::Any => f.write_str("*"),
            EidPattern::Prefix(p) => write!(f, "{p}*"),
            EidPattern::Exact(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for EidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for EidPattern {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(EidPattern::Any)
        } else if let Some(prefix) = s.strip_suffix('*') {
            Ok(EidPattern::Prefix(prefix.to_string()))
        } else {
            s.parse().map(EidPattern::Exact)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let eid: Eid = "dtn://node-a/app".parse().unwrap();
        assert_eq!(eid.scheme(), "dtn");
        assert_eq!(eid.ssp(), "//node-a/app");
        assert_eq!(eid.host(), "node-a");
        assert_eq!(eid.to_string(), "dtn://node-a/app");

        assert!("dtn:none".parse::<Eid>().unwrap().is_null());
        assert!("no-separator".parse::<Eid>().is_err());
    }

    #[test]
    fn pattern_matching() {
        let eid: Eid = "dtn://node-a/app".parse().unwrap();

        assert!(EidPattern::Null.matches(&eid));
        assert!("*".parse::<EidPattern>().unwrap().matches(&eid));
        assert!("dtn://node-a/*".parse::<EidPattern>().unwrap().matches(&eid));
        assert!(!"dtn://node-b/*".parse::<EidPattern>().unwrap().matches(&eid));
        assert!(
            "dtn://node-a/app"
                .parse::<EidPattern>()
                .unwrap()
                .matches(&eid)
        );
        assert!(!EidPattern::Exact(Eid::Null).matches(&eid));
    }
}
