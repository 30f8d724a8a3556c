//! DMSG transactional message engine: wire codec, the ingress/egress
//! pipelines, the transaction state machine (reader/writer trees),
//! router/relay, and the crypto adapter seam. Transport-agnostic -- this
//! crate never touches a real socket or `poll(2)`; that lives in `dmsgd`,
//! the way `nvme-core` stays free of Redox scheme/IRQ plumbing and leaves
//! that to `nvme-driver`.

pub mod codec;
pub mod crc;
pub mod crypto;
pub mod decoder;
pub mod egress;
pub mod error;
pub mod header;
pub mod iocom;
pub mod message;
pub mod relay;
pub mod state;

pub use codec::{decode, encode};
pub use crypto::{CryptoAdapter, PlaintextAdapter};
pub use error::DmsgError;
pub use header::{DmsgCmd, DmsgFlags, DmsgHeader, MAGIC, MAGIC_REV};
pub use iocom::{Disposition, IOCom, IocomFlags};
pub use message::{ExtendedHeader, Message};
pub use relay::{Relay, RelaySide};
pub use state::{RxEvent, StateId, StateTable};
