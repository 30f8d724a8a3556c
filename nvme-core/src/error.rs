use syscall::error::{Error, ENXIO};

/// Errors raised by the chipset bring-up/teardown sequence. Surfaced to
/// attach/detach as `ENXIO`, matching spec §4.1/§7.
#[derive(Debug, thiserror::Error)]
pub enum ChipsetError {
    #[error("controller did not become ready within the CAP.TIMEOUT bound")]
    EnableTimeout,
    #[error("controller did not clear STATUS.RDY within the CAP.TIMEOUT bound")]
    DisableTimeout,
    #[error("controller did not report STATUS.SHUT=DONE within 10s of shutdown request")]
    ShutdownTimeout,
}

impl From<ChipsetError> for Error {
    fn from(_: ChipsetError) -> Error {
        Error::new(ENXIO)
    }
}
