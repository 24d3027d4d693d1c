use serde::{Deserialize, Serialize};

/// DNS record types the proxy understands natively.
///
/// Anything else round-trips through `Other` so forwarded responses are never
/// rejected over an unknown type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryType {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Ptr,
    Soa,
    Txt,
    Srv,
    Other(u16),
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            12 => QueryType::Ptr,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            other => QueryType::Other(other),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(value: QueryType) -> Self {
        match value {
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Ptr => 12,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Other(other) => other,
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryType::A => write!(f, "A"),
            QueryType::Aaaa => write!(f, "AAAA"),
            QueryType::Cname => write!(f, "CNAME"),
            QueryType::Mx => write!(f, "MX"),
            QueryType::Ns => write!(f, "NS"),
            QueryType::Ptr => write!(f, "PTR"),
            QueryType::Soa => write!(f, "SOA"),
            QueryType::Txt => write!(f, "TXT"),
            QueryType::Srv => write!(f, "SRV"),
            QueryType::Other(n) => write!(f, "TYPE{}", n),
        }
    }
}

/// Response codes the proxy emits.
pub mod rcode {
    pub const NOERROR: u8 = 0;
    pub const FORMERR: u8 = 1;
    pub const SERVFAIL: u8 = 2;
    pub const NXDOMAIN: u8 = 3;
}

/// The IN class; the proxy neither emits nor special-cases any other class.
pub const CLASS_IN: u16 = 1;
