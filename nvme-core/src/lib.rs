//! NVMe host controller core: chipset bring-up/teardown, queue-pair
//! management, the request bank and PRP builder, the completion poller and
//! the admin thread state machine. Transport-agnostic: nothing in this
//! crate knows about Redox schemes, IRQ files or block devices -- that
//! lives in the driver binary built on top of it.

pub mod admin;
pub mod chipset;
pub mod cmd;
pub mod controller;
pub mod doorbell;
pub mod error;
pub mod identify;
pub mod poller;
pub mod queue_manager;
pub mod queues;
pub mod regs;
pub mod request;

pub use cmd::{NvmeCmd, NvmeComp};
pub use controller::{Controller, IoQueuePair, NamespaceGeometry};
pub use doorbell::Doorbell;
pub use error::ChipsetError;
pub use identify::{IdentifyControllerData, IdentifyNamespaceData};
pub use queues::{CompletionQueue, SubmissionQueue};
pub use regs::{ControllerCaps, NvmeRegs};
pub use request::{RequestBank, RequestHandle, RequestState};
