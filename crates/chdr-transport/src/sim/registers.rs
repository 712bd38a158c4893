//! Register bank with firmware claim emulation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chdr_core::regs::{CLAIM_STATUS_REG, CLAIM_TIME_REG};

use crate::ctrl::RegisterIface;
use crate::error::TransportResult;

/// Firmware drops a claim whose time has not changed for this long.
pub const FW_CLAIM_EXPIRY: Duration = Duration::from_secs(2);

/// In-memory register file. Unwritten registers read as zero.
///
/// The claim status word is maintained the way device firmware does it:
/// it goes high when the claim time changes and drops when the time is
/// cleared or stops changing for the expiry period.
pub struct SimulatedRegisters {
    inner: Mutex<Bank>,
}

struct Bank {
    regs: HashMap<u32, u32>,
    last_time: u32,
    last_change: Instant,
    expiry: Option<Duration>,
}

impl Bank {
    fn update_claim(&mut self) {
        let time = self.regs.get(&CLAIM_TIME_REG).copied().unwrap_or(0);
        let status = self.regs.get(&CLAIM_STATUS_REG).copied().unwrap_or(0);
        let expired = self
            .expiry
            .is_some_and(|expiry| self.last_change.elapsed() > expiry);
        if status != 0 && (time == 0 || expired) {
            self.regs.insert(CLAIM_STATUS_REG, 0);
            self.last_time = time;
        } else if time != self.last_time {
            self.regs.insert(CLAIM_STATUS_REG, 1);
            self.last_time = time;
            self.last_change = Instant::now();
        }
    }
}

impl Default for SimulatedRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRegisters {
    pub fn new() -> Self {
        Self::with_expiry(Some(FW_CLAIM_EXPIRY))
    }

    /// `None` emulates firmware that never expires a claim.
    pub fn with_expiry(expiry: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Bank {
                regs: HashMap::new(),
                last_time: 0,
                last_change: Instant::now(),
                expiry,
            }),
        }
    }

    fn bank(&self) -> MutexGuard<'_, Bank> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read(&self, addr: u32) -> u32 {
        let mut bank = self.bank();
        bank.update_claim();
        bank.regs.get(&addr).copied().unwrap_or(0)
    }

    pub fn write(&self, addr: u32, data: u32) {
        let mut bank = self.bank();
        bank.regs.insert(addr, data);
        bank.update_claim();
    }
}

#[async_trait]
impl RegisterIface for SimulatedRegisters {
    async fn peek32(&self, addr: u32) -> TransportResult<u32> {
        Ok(self.read(addr))
    }

    async fn poke32(&self, addr: u32, data: u32) -> TransportResult<()> {
        self.write(addr, data);
        Ok(())
    }
}
