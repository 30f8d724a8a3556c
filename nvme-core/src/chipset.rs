//! Chipset bring-up/teardown sequencing (spec §4.1): enable, disable and
//! shutdown, each bounded by a timeout derived from `CAP.TIMEOUT`.

use std::time::{Duration, Instant};

use common::Io;

use crate::error::ChipsetError;
use crate::regs::{
    ControllerCaps, NvmeRegs, CC_EN, CC_SHN_MASK, CC_SHN_NORMAL, CSTS_RDY, CSTS_SHST_DONE,
    CSTS_SHST_MASK,
};

/// Polls `csts` until `predicate` is satisfied or `timeout` elapses. Used
/// by `enable`/`disable`/`shutdown` so each has a single, shared waiting
/// loop instead of three ad hoc copies.
fn poll_until(
    mut read_csts: impl FnMut() -> u32,
    timeout: Duration,
    predicate: impl Fn(u32) -> bool,
) -> Result<(), ()> {
    let deadline = Instant::now() + timeout;
    loop {
        let csts = read_csts();
        if predicate(csts) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(());
        }
        std::thread::sleep(Duration::from_micros(500));
    }
}

/// Standard CC/CSTS register bring-up, spec §4.1: write AQA/ASQ/ACQ before
/// setting CC.EN, then wait for CSTS.RDY, bounded by `CAP.TIMEOUT`.
pub fn enable(
    regs: &NvmeRegs,
    caps: &ControllerCaps,
    aqa: u32,
    asq: u64,
    acq: u64,
    css: u32,
    mps: u32,
) -> Result<(), ChipsetError> {
    regs.aqa.write(aqa);
    regs.asq_low.write(asq as u32);
    regs.asq_high.write((asq >> 32) as u32);
    regs.acq_low.write(acq as u32);
    regs.acq_high.write((acq >> 32) as u32);

    let cc = CC_EN | (css << 4) | (mps << 7) | (0 << 11) | (0 << 14) | (4 << 16) | (6 << 20);
    regs.cc.write(cc);

    poll_until(
        || regs.csts.read(),
        caps.enable_timeout(),
        |csts| csts & CSTS_RDY != 0,
    )
    .map_err(|_| ChipsetError::EnableTimeout)
}

/// Clears CC.EN and waits for CSTS.RDY to drop, bounded by `CAP.TIMEOUT`
/// (spec §4.1 -- used before a full re-enable, distinct from `shutdown`'s
/// graceful CSTS.SHST handshake).
pub fn disable(regs: &NvmeRegs, caps: &ControllerCaps) -> Result<(), ChipsetError> {
    let cc = regs.cc.read();
    regs.cc.write(cc & !CC_EN);
    poll_until(
        || regs.csts.read(),
        caps.enable_timeout(),
        |csts| csts & CSTS_RDY == 0,
    )
    .map_err(|_| ChipsetError::DisableTimeout)
}

/// Requests a normal shutdown (CC.SHN = 01b) and waits up to 10 seconds
/// for CSTS.SHST to report DONE. A timeout here is logged, not propagated
/// as a hard failure: the host side of teardown (queue deletion, BAR
/// unmap) still needs to happen even if the controller never acknowledges
/// (spec §4.1/§7).
pub fn shutdown(regs: &NvmeRegs) -> Result<(), ChipsetError> {
    let cc = regs.cc.read();
    regs.cc.write((cc & !CC_SHN_MASK) | CC_SHN_NORMAL);
    let result = poll_until(
        || regs.csts.read(),
        Duration::from_secs(10),
        |csts| csts & CSTS_SHST_MASK == CSTS_SHST_DONE,
    );
    if result.is_err() {
        log::warn!("nvme: controller did not report shutdown complete within 10s, proceeding anyway");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_caps() -> ControllerCaps {
        ControllerCaps {
            mqes: 64,
            cqr: false,
            ams: 0,
            timeout_500ms: 0,
            dstrd: 0,
            subreset_supported: false,
            css: 1,
            mempg_min: 0,
            mempg_max: 0,
        }
    }

    #[test]
    fn poll_until_succeeds_when_predicate_true_immediately() {
        let result = poll_until(|| 1u32, Duration::from_millis(10), |csts| csts == 1);
        assert!(result.is_ok());
    }

    #[test]
    fn poll_until_times_out_when_predicate_never_true() {
        let result = poll_until(|| 0u32, Duration::from_millis(1), |csts| csts == 1);
        assert!(result.is_err());
    }

    #[test]
    fn enable_timeout_uses_cap_register() {
        let caps = fake_caps();
        assert_eq!(caps.enable_timeout(), Duration::from_millis(500));
    }
}
