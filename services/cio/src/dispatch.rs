//! # Request Dispatch
//!
//! Entry points drivers use to start, halt and resume channel programs.
//!
//! Every public function takes the subchannel lock and forwards to a
//! `*_locked` variant; the locked variants are also what interrupt handlers
//! reach through [`IrqContext`](crate::IrqContext) and what the interrupt
//! path uses for internally issued sense requests.
//!
//! ## Synchronous requests
//!
//! [`IoFlags::WAIT_FOR_INTERRUPT`] moves the subchannel onto the synchronous
//! interruption subclass, narrows the CPU mask and polls `tpi` until the
//! request has completed. Interruptions for other subchannels seen while
//! polling are processed in passing.

use crate::ccw::{ChannelProgram, IoFlags, Orb};
use crate::css::ChannelSubsystem;
use crate::devstat::DevStatFlags;
use crate::hw::{ConditionCode, SubchannelId};
use crate::schib::Irb;
use crate::subchannel::{QueuedRequest, Subchannel, UsageFlags};
use crate::CioError;

impl ChannelSubsystem {
    /// Starts a channel program on a registered subchannel.
    ///
    /// `lpm` is only used with [`IoFlags::VALID_LPM`]. While an early-notified
    /// request waits for its final status, one further request is accepted
    /// into the queue slot and started once the first one completes.
    pub fn start_io(
        &self,
        irq: SubchannelId,
        program: ChannelProgram,
        intparm: u32,
        lpm: u8,
        flags: IoFlags,
    ) -> Result<(), CioError> {
        let mut sch = self.lock(irq)?;
        self.do_io_locked(&mut sch, program, intparm, lpm, flags)
    }

    /// Halts the current request of a registered subchannel.
    ///
    /// A request waiting in the queue slot is discarded without being
    /// reported; the driver only sees the outcome of the halted request.
    pub fn halt_io(&self, irq: SubchannelId, intparm: u32, flags: IoFlags) -> Result<(), CioError> {
        let mut sch = self.lock(irq)?;
        self.halt_io_locked(&mut sch, intparm, flags)
    }

    /// Resumes a suspended channel program.
    pub fn resume_io(&self, irq: SubchannelId) -> Result<(), CioError> {
        let mut sch = self.lock(irq)?;
        self.resume_io_locked(&mut sch)
    }

    pub(crate) fn do_io_locked(
        &self,
        sch: &mut Subchannel,
        program: ChannelProgram,
        intparm: u32,
        lpm: u8,
        flags: IoFlags,
    ) -> Result<(), CioError> {
        if !sch.flags.contains(UsageFlags::READY) || sch.flags.contains(UsageFlags::UNREADY) {
            return Err(CioError::NotRegistered);
        }
        if program.ccws().is_empty() {
            return Err(CioError::InvalidArgument);
        }

        if !sch.flags.contains(UsageFlags::BUSY) {
            return self.s390_start_io_locked(sch, program, intparm, lpm, flags);
        }

        // A synchronous request cannot wait in the queue slot
        if sch.flags.contains(UsageFlags::FAST | UsageFlags::W4FINAL)
            && sch.queued.is_none()
            && !flags.contains(IoFlags::WAIT_FOR_INTERRUPT)
        {
            log::trace!("do_io({}) - request queued, intparm {:08X}", sch.irq, intparm);
            sch.queued = Some(QueuedRequest {
                program,
                intparm,
                lpm,
                flags,
            });
            return Ok(());
        }

        Err(CioError::Busy)
    }

    /// Issues start-subchannel without looking at the busy state.
    pub(crate) fn s390_start_io_locked(
        &self,
        sch: &mut Subchannel,
        program: ChannelProgram,
        intparm: u32,
        lpm: u8,
        flags: IoFlags,
    ) -> Result<(), CioError> {
        let orb = Orb::build(program.clone(), intparm, lpm, sch.opm, flags);

        let sync = if flags.contains(IoFlags::WAIT_FOR_INTERRUPT) {
            Some(self.enable_cpu_sync_isc(sch)?)
        } else {
            None
        };

        let cc = self.machine.start_subchannel(sch.irq, &orb);
        let result = match cc {
            ConditionCode::Success => {
                if !sch.flags.contains(UsageFlags::W4SENSE) {
                    sch.udevstat.irb = Irb::default();
                }
                sch.devstat.reset_for_start(intparm);

                sch.flags.insert(UsageFlags::BUSY | UsageFlags::DOIO);
                sch.flags.remove(UsageFlags::FAST | UsageFlags::REPALL | UsageFlags::REPNONE);
                if flags.contains(IoFlags::RETURN_CHAN_END) {
                    sch.flags.insert(UsageFlags::FAST);
                } else if flags.contains(IoFlags::REPORT_ALL) {
                    sch.flags.insert(UsageFlags::REPALL);
                }
                if flags.contains(IoFlags::DONT_CALL_HANDLER) {
                    sch.flags.insert(UsageFlags::REPNONE);
                }
                sch.ulpm = orb.lpm;
                sch.active = Some(program);

                if flags.contains(IoFlags::WAIT_FOR_INTERRUPT) {
                    self.wait_for_interrupt(sch);
                    if sch.udevstat.flag.contains(DevStatFlags::NOT_OPER) {
                        Err(CioError::DeviceGone)
                    } else {
                        Ok(())
                    }
                } else {
                    Ok(())
                }
            }
            ConditionCode::StatusPending => {
                // Process the pending status without bothering the driver
                sch.devstat.reset_for_start(intparm);
                sch.devstat.flag = DevStatFlags::STATUS_PENDING;
                sch.udevstat.irb = Irb::default();
                sch.flags.insert(UsageFlags::BUSY | UsageFlags::DOIO);
                self.process_pending_inline(sch);

                sch.flags.remove(
                    UsageFlags::BUSY | UsageFlags::DOIO | UsageFlags::REPALL | UsageFlags::W4FINAL,
                );
                sch.devstat.flag.insert(DevStatFlags::FINAL_STATUS);
                sch.udevstat
                    .flag
                    .insert(DevStatFlags::FINAL_STATUS | DevStatFlags::STATUS_PENDING);
                sch.active = None;

                if sch.devstat.flag.contains(DevStatFlags::NOT_OPER) {
                    sch.udevstat.flag.insert(DevStatFlags::NOT_OPER);
                    Err(CioError::DeviceGone)
                } else {
                    sch.flags.insert(UsageFlags::OPER);
                    Err(CioError::IoError)
                }
            }
            ConditionCode::Busy => Err(CioError::Busy),
            ConditionCode::NotOperational => {
                // Only the requested paths may be gone
                if flags.contains(IoFlags::VALID_LPM) && lpm != 0 && lpm != sch.opm {
                    sch.opm &= !lpm;
                } else {
                    sch.opm = 0;
                }
                if sch.opm == 0 {
                    sch.flags.remove(UsageFlags::OPER);
                }
                sch.devstat.intparm = intparm;
                sch.devstat.flag.insert(DevStatFlags::NOT_OPER);
                sch.udevstat = sch.devstat.clone();
                log::debug!(
                    "start_io({}) - path(s) {:02X} not operational, opm {:02X}",
                    sch.irq,
                    orb.lpm,
                    sch.opm
                );
                Err(CioError::DeviceGone)
            }
            other => {
                log::error!("start_io({}) - ssch returned cc {}", sch.irq, other.raw());
                Err(CioError::UnexpectedConditionCode(other.raw()))
            }
        };

        if let Some(section) = sync {
            self.disable_cpu_sync_isc(sch, section);
        }
        result
    }

    /// Polls until the outstanding request of `sch` has completed.
    ///
    /// Interruptions for other subchannels are processed in passing, taking
    /// their locks while `sch` and the synchronous-I/O lock are held. Only the
    /// synchronous and console subclasses are enabled at this point, so no
    /// console-subclass subchannel may itself issue synchronous requests.
    pub(crate) fn wait_for_interrupt(&self, sch: &mut Subchannel) {
        while sch.flags.contains(UsageFlags::BUSY) {
            match self.machine.test_pending_interruption() {
                Some(code) if code.irq == sch.irq => {
                    if let Err(e) = self.process_locked(sch) {
                        log::error!("wait_for_interrupt({}) - {}", sch.irq, e);
                    }
                }
                Some(code) => self.handle_interruption(code),
                None => core::hint::spin_loop(),
            }
        }
    }

    pub(crate) fn halt_io_locked(
        &self,
        sch: &mut Subchannel,
        intparm: u32,
        flags: IoFlags,
    ) -> Result<(), CioError> {
        if !sch.flags.contains(UsageFlags::READY) {
            return Err(CioError::NotRegistered);
        }
        // The internal sense has to complete first
        if sch.flags.contains(UsageFlags::W4SENSE) {
            return Ok(());
        }
        if sch.flags.contains(UsageFlags::SYNCIO) {
            return Err(CioError::Busy);
        }

        if let Some(queued) = sch.queued.take() {
            log::debug!(
                "halt_io({}) - discarding queued request, intparm {:08X}",
                sch.irq,
                queued.intparm
            );
        }

        let sync = if flags.contains(IoFlags::WAIT_FOR_INTERRUPT) {
            Some(self.enable_cpu_sync_isc(sch)?)
        } else {
            None
        };

        let result = match self.machine.halt_subchannel(sch.irq) {
            ConditionCode::Success => {
                sch.flags.insert(UsageFlags::HALTIO);
                if !sch.flags.contains(UsageFlags::DOIO) {
                    sch.flags.insert(UsageFlags::BUSY);
                    sch.devstat.intparm = intparm;
                    sch.devstat.cstat = Default::default();
                    sch.devstat.dstat = Default::default();
                    sch.devstat.lpum = 0;
                    sch.devstat.flag = DevStatFlags::HALT_FUNCTION;
                    sch.devstat.scnt = 0;
                } else {
                    sch.devstat.flag.insert(DevStatFlags::HALT_FUNCTION);
                }
                if flags.contains(IoFlags::WAIT_FOR_INTERRUPT) {
                    self.wait_for_interrupt(sch);
                }
                Ok(())
            }
            ConditionCode::StatusPending => {
                sch.devstat.flag.insert(DevStatFlags::STATUS_PENDING);
                self.process_pending_inline(sch);
                sch.devstat.flag.insert(DevStatFlags::FINAL_STATUS);
                sch.udevstat
                    .flag
                    .insert(DevStatFlags::FINAL_STATUS | DevStatFlags::STATUS_PENDING);
                Err(CioError::IoError)
            }
            ConditionCode::Busy => Err(CioError::Busy),
            ConditionCode::NotOperational => {
                sch.flags.remove(UsageFlags::OPER);
                sch.devstat.flag.insert(DevStatFlags::NOT_OPER);
                sch.udevstat = sch.devstat.clone();
                Err(CioError::DeviceGone)
            }
            other => {
                log::error!("halt_io({}) - hsch returned cc {}", sch.irq, other.raw());
                Err(CioError::UnexpectedConditionCode(other.raw()))
            }
        };

        if let Some(section) = sync {
            self.disable_cpu_sync_isc(sch, section);
        }
        result
    }

    pub(crate) fn resume_io_locked(&self, sch: &mut Subchannel) -> Result<(), CioError> {
        if !sch.flags.contains(UsageFlags::READY) {
            return Err(CioError::NotRegistered);
        }
        if !sch.flags.contains(UsageFlags::BUSY) {
            return Err(CioError::NotActive);
        }

        match self.machine.resume_subchannel(sch.irq) {
            ConditionCode::Success => Ok(()),
            ConditionCode::StatusPending => {
                self.process_locked(sch)?;
                Err(CioError::Busy)
            }
            ConditionCode::Busy => Err(CioError::NotSuspended),
            ConditionCode::NotOperational => {
                sch.flags.remove(UsageFlags::OPER | UsageFlags::BUSY);
                Err(CioError::DeviceGone)
            }
            other => {
                log::error!("resume_io({}) - rsch returned cc {}", sch.irq, other.raw());
                Err(CioError::UnexpectedConditionCode(other.raw()))
            }
        }
    }
}
