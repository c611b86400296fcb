/*!
RFC 5050 bundle block format and Bundle Security Protocol engine.

This crate implements the per-block wire codec (preamble + SDNV framing,
chunk-tolerant streaming ingestion), the compressed endpoint-ID dictionary,
and the BSP ciphersuite framework: Bundle Authentication (BAB), Payload
Integrity (PIB), Payload Confidentiality (PCB) and Extension Security (ESB)
blocks, together with the key store and the security policy database that
drive them.
*/

pub mod block;
pub mod bsp;
pub mod bundle;
pub mod dictionary;
pub mod eid;
pub mod metadata;

mod error;
mod primary;

pub use block::{BlockInfo, BlockList, BlockType};
pub use bundle::Bundle;
pub use dictionary::Dictionary;
pub use eid::{Eid, EidPattern};
pub use error::Error;

use tracing::{debug, info, warn};
