//! # Interrupt Reconciliation
//!
//! Turns the status stored by test-subchannel into driver notifications.
//!
//! ```text
//!            start_io                 primary (fast)
//!   Idle ─────────────► Awaiting ─────────────────► W4Final
//!    ▲                 Completion                     │
//!    │                    │  unit check               │ secondary
//!    │    final status    ▼  (no concurrent sense)    │
//!    ├──────────────── W4Sense ◄──────────────────────┤
//!    │                    │                           │
//!    └────────────────────┴─── final / not oper ◄─────┘
//!                                   │
//!                                   └─► queued request started
//! ```
//!
//! Status of a request the subsystem started is OR-merged across
//! interruptions; anything else overwrites the accumulated status.

use alloc::string::String;
use core::fmt::Write;

use crate::ccw::{Ccw, CcwFlags, ChannelProgram, IoFlags, CCW_CMD_BASIC_SENSE};
use crate::css::ChannelSubsystem;
use crate::devstat::{DevStatFlags, SENSE_MAX_COUNT};
use crate::hw::{ConditionCode, InterruptionCode, SubchannelId};
use crate::schib::{ChannelStatus, DeviceStatus, Irb, StatusControl};
use crate::subchannel::{IrqContext, QueuedRequest, Subchannel, UsageFlags};
use crate::{CioError, SENSE_INTPARM};

/// Flags describing an operation in flight.
const IN_FLIGHT: UsageFlags = UsageFlags::BUSY
    .union(UsageFlags::DOIO)
    .union(UsageFlags::HALTIO)
    .union(UsageFlags::FAST)
    .union(UsageFlags::REPALL)
    .union(UsageFlags::W4FINAL);

impl ChannelSubsystem {
    /// I/O interruption entry point.
    ///
    /// Handles `code` and then keeps draining interruptions reported by
    /// test-pending-interruption until none is left.
    ///
    /// # Panics
    ///
    /// Panics if an interruption arrives for a subchannel that has neither a
    /// handler nor a pending deferred disable.
    pub fn do_irq(&self, code: InterruptionCode) {
        let mut next = Some(code);
        while let Some(code) = next {
            self.handle_interruption(code);
            next = self.machine.test_pending_interruption();
        }
    }

    pub(crate) fn handle_interruption(&self, code: InterruptionCode) {
        let irq = code.irq;
        let Some(slot) = self.subchannels.get(irq.index()) else {
            log::error!("do_irq({}) - interruption for unknown subchannel", irq);
            let _ = self.machine.test_subchannel(irq);
            return;
        };

        let mut sch = slot.lock();
        if sch.action.is_none() && !sch.flags.contains(UsageFlags::D_DISABLE) {
            log::error!(
                "do_irq({}) - interruption for device {:04X} without handler",
                irq,
                sch.schib.pmcw.dev
            );
            panic!("do_irq({}) - no handler registered", irq);
        }

        if let Err(e) = self.process_locked(&mut sch) {
            log::error!("do_irq({}) - {}", irq, e);
        }
    }

    /// Processes the status pending on a subchannel.
    ///
    /// Returns whether ending status was seen. Calling it again once the
    /// request has completed reports `false` and does not notify the driver.
    pub fn process_interrupt(&self, irq: SubchannelId) -> Result<bool, CioError> {
        let mut sch = self.lock(irq)?;
        self.process_locked(&mut sch)
    }

    pub(crate) fn process_locked(&self, sch: &mut Subchannel) -> Result<bool, CioError> {
        let (cc, irb) = self.machine.test_subchannel(sch.irq);
        #[cfg(feature = "debug")]
        log::trace!("tsch({}) cc {} irb {:?}", sch.irq, cc.raw(), irb);

        match cc {
            ConditionCode::Success => Ok(self.process_status(sch, irb, false)),
            ConditionCode::StatusPending => Ok(self.process_status(sch, irb, true)),
            ConditionCode::NotOperational => Ok(self.process_not_oper(sch)),
            other => {
                log::error!(
                    "process_irq({}) - tsch returned cc {}, device {:04X} forced offline",
                    sch.irq,
                    other.raw(),
                    sch.schib.pmcw.dev
                );
                self.process_not_oper(sch);
                Err(CioError::UnexpectedConditionCode(other.raw()))
            }
        }
    }

    fn process_status(&self, sch: &mut Subchannel, irb: Irb, status_pending: bool) -> bool {
        let scsw = irb.scsw;
        // No status was stored; nothing completed
        if !scsw.stctl.contains(StatusControl::STATUS_PEND) {
            log::trace!("process_irq({}) - no status pending", sch.irq);
            return false;
        }
        let busy = sch.flags.contains(UsageFlags::BUSY);

        let ds = &mut sch.devstat;
        if busy {
            ds.dstat |= scsw.dstat;
            ds.cstat |= scsw.cstat;
        } else {
            ds.dstat = scsw.dstat;
            ds.cstat = scsw.cstat;
            ds.flag = DevStatFlags::empty();
            ds.intparm = 0;
        }
        ds.lpum = irb.esw.lpum;
        if !scsw.dstat.contains(DeviceStatus::BUSY) {
            ds.dstat.remove(DeviceStatus::BUSY);
        }
        if scsw.stctl.intersects(StatusControl::PRIMARY | StatusControl::INTERMEDIATE)
            || scsw.count != 0
        {
            ds.rescnt = scsw.count;
        }
        if scsw.cpa != 0 {
            ds.cpa = scsw.cpa;
        }
        ds.irb = irb;

        if scsw
            .cstat
            .intersects(ChannelStatus::CHANNEL_CONTROL_CHECK | ChannelStatus::INTERFACE_CONTROL_CHECK)
        {
            log::warn!(
                "process_irq({}) - channel check {:02X} on device {:04X}, lpum {:02X}",
                sch.irq,
                scsw.cstat.bits(),
                sch.schib.pmcw.dev,
                irb.esw.lpum
            );
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("ecw: {}", hexdump(&irb.ecw));
            }
        }

        if irb.has_concurrent_sense() {
            let count = match irb.esw.erw.scnt as usize {
                0 => SENSE_MAX_COUNT,
                n => n.min(SENSE_MAX_COUNT),
            };
            ds.sense = irb.ecw;
            ds.scnt = count as u8;
            ds.flag.insert(DevStatFlags::SENSE_AVAIL);
        }
        if status_pending {
            ds.flag.insert(DevStatFlags::STATUS_PENDING);
        }

        let mut ending = irb.is_ending_status();

        // Deferred cc 3: the path used went away
        if scsw.cc == 3 {
            let path = if irb.esw.lpum != 0 { irb.esw.lpum } else { sch.ulpm };
            sch.opm &= !path;
            if sch.opm == 0 {
                sch.devstat.flag.insert(DevStatFlags::NOT_OPER);
                sch.flags.remove(UsageFlags::OPER);
            }
            log::debug!(
                "process_irq({}) - deferred cc 3 on path {:02X}, opm {:02X}",
                sch.irq,
                path,
                sch.opm
            );
            ending = true;
        }

        sch.stctl |= scsw.stctl;
        if !busy && !scsw.stctl.contains(StatusControl::ALERT) {
            log::debug!(
                "process_irq({}) - unsolicited status {:02X}/{:02X}",
                sch.irq,
                scsw.dstat.bits(),
                scsw.cstat.bits()
            );
        }

        let was_not_oper = !sch.flags.contains(UsageFlags::OPER);
        if !sch.devstat.flag.contains(DevStatFlags::NOT_OPER) {
            sch.flags.insert(UsageFlags::OPER);
        }

        if sch.action.is_none() {
            if ending {
                sch.flags.remove(IN_FLIGHT);
                sch.active = None;
            }
            if sch.flags.contains(UsageFlags::D_DISABLE) {
                sch.flags.remove(UsageFlags::D_DISABLE);
                if let Err(e) = self.disable_subchannel_locked(sch) {
                    log::warn!("process_irq({}) - deferred disable failed: {}", sch.irq, e);
                    sch.flags.insert(UsageFlags::D_DISABLE);
                }
            }
            return ending;
        }

        let unit_check = sch.devstat.dstat.contains(DeviceStatus::UNIT_CHECK)
            && !sch.devstat.flag.contains(DevStatFlags::SENSE_AVAIL);
        let in_sense = sch.flags.contains(UsageFlags::W4SENSE);
        let mut allow = true;

        if (unit_check && !in_sense) || (sch.flags.contains(UsageFlags::DELSENSE) && ending) {
            if ending {
                allow = !self.start_auto_sense(sch);
            } else {
                sch.flags.remove(UsageFlags::FAST | UsageFlags::REPALL);
                sch.flags.insert(UsageFlags::DELSENSE);
                allow = false;
            }
        }

        // Nothing is reported while the internal sense is still running
        if !allow || (in_sense && !ending) {
            return ending;
        }

        let report = ending
            || sch.flags.contains(UsageFlags::REPALL)
            || scsw.stctl.contains(StatusControl::INTERMEDIATE)
            || scsw.cstat.contains(ChannelStatus::PCI)
            || (sch.flags.contains(UsageFlags::FAST) && scsw.stctl.contains(StatusControl::PRIMARY))
            || was_not_oper;
        if !report {
            return ending;
        }

        if in_sense && ending {
            let count = SENSE_MAX_COUNT.saturating_sub(sch.devstat.rescnt as usize);
            let n = sch.sense_buffer.read_into(&mut sch.udevstat.sense[..count]);
            sch.udevstat.scnt = n as u8;
            if n > 0 {
                sch.udevstat.flag.insert(DevStatFlags::SENSE_AVAIL);
            }
            sch.flags.remove(UsageFlags::W4SENSE);
        } else if !in_sense {
            sch.udevstat = sch.devstat.clone();
        }

        if ending {
            self.finish_request(sch);
        } else {
            if sch.flags.contains(UsageFlags::FAST) {
                sch.flags.insert(UsageFlags::W4FINAL);
            }
            if !sch.flags.intersects(UsageFlags::S_PEND | UsageFlags::REPNONE) {
                self.call_handler(sch);
            }
        }

        ending
    }

    /// Ends the current request: reports final status and starts the queued
    /// request, if any.
    fn finish_request(&self, sch: &mut Subchannel) {
        sch.stctl = StatusControl::empty();
        sch.flags.remove(IN_FLIGHT);
        sch.devstat.flag.insert(DevStatFlags::FINAL_STATUS);
        sch.udevstat.flag.insert(DevStatFlags::FINAL_STATUS);
        sch.active = None;
        sch.devstat.intparm = 0;

        let quiet = sch.flags.intersects(UsageFlags::S_PEND | UsageFlags::REPNONE);
        sch.flags.remove(UsageFlags::REPNONE);
        if !quiet {
            self.call_handler(sch);
        }

        // The handler may have started a new request itself
        if sch.flags.contains(UsageFlags::BUSY) {
            return;
        }
        if let Some(queued) = sch.queued.take() {
            log::trace!("process_irq({}) - starting queued request", sch.irq);
            let QueuedRequest {
                program,
                intparm,
                lpm,
                flags,
            } = queued;
            if let Err(e) = self.s390_start_io_locked(sch, program, intparm, lpm, flags) {
                self.report_queued_failure(sch, intparm, e);
            }
        }
    }

    /// Starts BASIC SENSE into the subchannel's sense buffer.
    ///
    /// Returns `false` if the sense could not be started; the unit check is
    /// then reported as is.
    fn start_auto_sense(&self, sch: &mut Subchannel) -> bool {
        sch.udevstat = sch.devstat.clone();
        sch.flags.remove(
            UsageFlags::FAST | UsageFlags::REPALL | UsageFlags::W4FINAL | UsageFlags::DELSENSE,
        );
        sch.devstat.dstat = DeviceStatus::empty();
        sch.devstat.cstat = ChannelStatus::empty();
        sch.devstat.rescnt = SENSE_MAX_COUNT as u16;
        sch.flags.insert(UsageFlags::W4SENSE);

        let mut flags = IoFlags::empty();
        if sch
            .flags
            .intersects(UsageFlags::UNREADY | UsageFlags::SYNCIO | UsageFlags::S_PEND)
        {
            flags |= IoFlags::WAIT_FOR_INTERRUPT;
        }
        if sch.flags.contains(UsageFlags::REPNONE) {
            flags |= IoFlags::DONT_CALL_HANDLER;
        }
        let lpm = sch.udevstat.lpum;
        if lpm != 0 {
            flags |= IoFlags::VALID_LPM;
        }

        sch.sense_buffer.fill(0);
        let program = ChannelProgram::single(Ccw::new(
            CCW_CMD_BASIC_SENSE,
            CcwFlags::SLI,
            sch.sense_buffer.clone(),
        ));

        log::trace!("process_irq({}) - unit check, starting sense", sch.irq);
        match self.s390_start_io_locked(sch, program, SENSE_INTPARM, lpm, flags) {
            Ok(()) => true,
            // Already completed inline
            Err(_) if !sch.flags.contains(UsageFlags::W4SENSE) => true,
            Err(e) => {
                log::warn!("process_irq({}) - sense could not be started: {}", sch.irq, e);
                sch.flags.remove(UsageFlags::W4SENSE);
                sch.devstat = sch.udevstat.clone();
                false
            }
        }
    }

    fn process_not_oper(&self, sch: &mut Subchannel) -> bool {
        let irq = sch.irq;
        let devno = sch.schib.pmcw.dev;
        let in_sense = sch.flags.contains(UsageFlags::W4SENSE);

        sch.flags.remove(
            IN_FLIGHT | UsageFlags::W4SENSE | UsageFlags::DELSENSE | UsageFlags::OPER,
        );
        sch.stctl = StatusControl::empty();
        sch.active = None;
        sch.opm = 0;
        sch.devstat.flag.insert(DevStatFlags::NOT_OPER | DevStatFlags::FINAL_STATUS);
        if !in_sense {
            sch.udevstat = sch.devstat.clone();
        }
        sch.udevstat.flag.insert(DevStatFlags::NOT_OPER | DevStatFlags::FINAL_STATUS);
        sch.devstat.intparm = 0;

        log::debug!("process_irq({}) - device {:04X} not operational", irq, devno);

        let quiet = sch.flags.intersects(UsageFlags::S_PEND | UsageFlags::REPNONE);
        sch.flags.remove(UsageFlags::REPNONE);
        if sch.action.is_some() && !quiet {
            self.call_handler(sch);
        }

        if let Some(queued) = sch.queued.take() {
            self.report_queued_failure(sch, queued.intparm, CioError::DeviceGone);
        }

        if let Some(not_oper) = sch.action.as_ref().and_then(|a| a.not_oper.clone()) {
            not_oper(irq, devno);
        }

        true
    }

    /// Tells the driver that its queued request never started.
    fn report_queued_failure(&self, sch: &mut Subchannel, intparm: u32, err: CioError) {
        log::debug!(
            "process_irq({}) - queued request {:08X} failed: {}",
            sch.irq,
            intparm,
            err
        );
        sch.udevstat.intparm = intparm;
        sch.udevstat.flag.insert(DevStatFlags::FINAL_STATUS);
        if err == CioError::DeviceGone {
            sch.udevstat.flag.insert(DevStatFlags::NOT_OPER);
        } else {
            sch.udevstat.flag.insert(DevStatFlags::STATUS_PENDING);
        }
        self.call_handler(sch);
    }

    fn call_handler(&self, sch: &mut Subchannel) {
        let Some(handler) = sch.action.as_ref().map(|a| a.handler.clone()) else {
            return;
        };
        let status = sch.udevstat.clone();
        handler(&mut IrqContext::new(self, sch), &status);
    }
}

/// Formats bytes as space-separated big-endian words.
pub(crate) fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(4).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        for byte in chunk {
            let _ = write!(out, "{:02X}", byte);
        }
    }
    out
}
