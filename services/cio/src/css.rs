//! # Channel Subsystem
//!
//! The [`ChannelSubsystem`] owns the subchannel arena and the hardware
//! backend. This module holds construction, handler registration and the
//! enable/disable and synchronous-subclass primitives shared by the dispatch,
//! interrupt and discovery layers.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::ccw::IoFlags;
use crate::config::CioConfig;
use crate::devstat::DevStat;
use crate::hw::{ConditionCode, Machine, SubchannelId};
use crate::subchannel::{IoHandler, IrqAction, IrqContext, NotOperHandler, Subchannel, UsageFlags};
use crate::{CioError, HALT_INTPARM};

/// Owner token of the handlers installed by the synchronous helpers.
pub(crate) const TEMP_DEV_ID: u64 = u64::MAX;

/// The common I/O subsystem.
pub struct ChannelSubsystem {
    pub(crate) machine: Arc<dyn Machine>,
    pub(crate) config: CioConfig,
    /// One record per scanned subchannel, indexed by subchannel number
    pub(crate) subchannels: Vec<Mutex<Subchannel>>,
    /// Device numbers, fixed after discovery
    pub(crate) devnos: Vec<Option<u16>>,
    /// Serializes synchronous requests system-wide
    pub(crate) sync_lock: Mutex<()>,
}

/// Synchronous-subclass section entered by [`ChannelSubsystem::enable_cpu_sync_isc`].
pub(crate) struct SyncSection<'a> {
    guard: Option<MutexGuard<'a, ()>>,
    saved_mask: Option<u8>,
}

impl SyncSection<'_> {
    /// Section already held further up the call chain.
    fn nested() -> Self {
        Self {
            guard: None,
            saved_mask: None,
        }
    }

    fn is_nested(&self) -> bool {
        self.guard.is_none()
    }
}

impl ChannelSubsystem {
    /// Scans the channel subsystem and builds the subchannel table.
    ///
    /// Every discovered device is left disabled for interruptions until a
    /// driver registers a handler for it.
    pub fn init(machine: Arc<dyn Machine>, config: CioConfig) -> Self {
        let subchannels = crate::discovery::scan_subchannels(machine.as_ref(), &config);
        let devnos = subchannels
            .iter()
            .map(|sch| sch.is_device().then(|| sch.schib.pmcw.dev))
            .collect();

        log::info!(
            "cio: {} subchannels, highest subchannel {}",
            subchannels.len(),
            subchannels
                .last()
                .map(|s| s.irq)
                .unwrap_or_default()
        );

        Self {
            machine,
            config,
            subchannels: subchannels.into_iter().map(Mutex::new).collect(),
            devnos,
            sync_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CioConfig {
        &self.config
    }

    /// Locks a device-bearing subchannel.
    pub(crate) fn lock(&self, irq: SubchannelId) -> Result<MutexGuard<'_, Subchannel>, CioError> {
        match self.devnos.get(irq.index()) {
            Some(Some(_)) => Ok(self.subchannels[irq.index()].lock()),
            _ => Err(CioError::InvalidSubchannel),
        }
    }

    /// Registers the interrupt handler of a subchannel and enables it.
    ///
    /// Subchannel interrupts cannot be shared; a second registration fails
    /// with [`CioError::Busy`].
    pub fn register_handler(
        &self,
        irq: SubchannelId,
        name: &str,
        dev_id: u64,
        handler: IoHandler,
    ) -> Result<(), CioError> {
        self.register_handler_special(irq, name, dev_id, handler, None)
    }

    /// Like [`Self::register_handler`], additionally installing a callback for
    /// the device becoming not operational.
    pub fn register_handler_special(
        &self,
        irq: SubchannelId,
        name: &str,
        dev_id: u64,
        handler: IoHandler,
        not_oper: Option<NotOperHandler>,
    ) -> Result<(), CioError> {
        let mut sch = self.lock(irq)?;
        if sch.flags.contains(UsageFlags::READY) {
            log::debug!(
                "request_irq({}) - device {:04X} already owned by {:?}",
                irq,
                sch.schib.pmcw.dev,
                sch.owner()
            );
            return Err(CioError::Busy);
        }

        sch.action = Some(IrqAction {
            name: String::from(name),
            dev_id,
            handler,
            not_oper,
        });
        sch.flags.insert(UsageFlags::READY);
        sch.flags.remove(UsageFlags::D_DISABLE);

        if let Err(e) = self.enable_subchannel_locked(&mut sch) {
            sch.action = None;
            sch.flags.remove(UsageFlags::READY);
            return Err(e);
        }

        log::debug!("request_irq({}) - device {:04X} owned by {}", irq, sch.schib.pmcw.dev, name);
        Ok(())
    }

    /// Removes the handler registered with `dev_id` and disables the subchannel.
    ///
    /// # Panics
    ///
    /// Panics if the subchannel cannot be disabled within the configured number of retries,
    /// even after halting the outstanding request.
    pub fn unregister_handler(&self, irq: SubchannelId, dev_id: u64) -> Result<(), CioError> {
        let mut sch = self.lock(irq)?;
        match &sch.action {
            None => return Err(CioError::NotRegistered),
            Some(action) if action.dev_id != dev_id => {
                log::warn!("free_irq({}) - dev_id does not match", irq);
                return Err(CioError::InvalidArgument);
            }
            Some(_) => {}
        }
        self.free_locked(&mut sch);
        Ok(())
    }

    pub(crate) fn free_locked(&self, sch: &mut Subchannel) {
        sch.flags.insert(UsageFlags::UNREADY);

        let mut count = 0;
        loop {
            match self.disable_subchannel_locked(sch) {
                Ok(()) => break,
                Err(CioError::Busy) => {
                    count += 1;
                    if count >= self.config.free_retries {
                        log::error!(
                            "free_irq({}) - device {:04X} busy, retry count exceeded",
                            sch.irq,
                            sch.schib.pmcw.dev
                        );
                        panic!("free_irq({}) - device busy, retry count exceeded", sch.irq);
                    }
                    if count + 1 == self.config.free_retries {
                        // kill it
                        let ret = self.halt_io_locked(sch, HALT_INTPARM, IoFlags::WAIT_FOR_INTERRUPT);
                        log::debug!("free_irq({}) - halt returned {:?}", sch.irq, ret);
                    } else {
                        self.machine.delay(self.config.busy_delay_us);
                    }
                }
                Err(e) => {
                    log::warn!("free_irq({}) - disable failed ({}), deferring", sch.irq, e);
                    sch.flags.insert(UsageFlags::D_DISABLE);
                    break;
                }
            }
        }

        sch.action = None;
        sch.flags.remove(UsageFlags::READY | UsageFlags::UNREADY);
    }

    /// Runs `f` with a handler registered, installing a throwaway one if the
    /// subchannel has no owner yet.
    pub(crate) fn with_temporary_handler<T>(
        &self,
        sch: &mut Subchannel,
        name: &str,
        f: impl FnOnce(&Self, &mut Subchannel) -> Result<T, CioError>,
    ) -> Result<T, CioError> {
        if sch.flags.contains(UsageFlags::READY) {
            return f(self, sch);
        }

        sch.action = Some(IrqAction {
            name: String::from(name),
            dev_id: TEMP_DEV_ID,
            handler: Arc::new(|_: &mut IrqContext<'_>, _: &DevStat| {}),
            not_oper: None,
        });
        sch.flags.insert(UsageFlags::READY);
        if let Err(e) = self.enable_subchannel_locked(sch) {
            sch.action = None;
            sch.flags.remove(UsageFlags::READY);
            return Err(e);
        }

        let result = f(self, sch);
        self.free_locked(sch);
        result
    }

    /// Enables the subchannel for I/O interruptions.
    pub(crate) fn enable_subchannel_locked(&self, sch: &mut Subchannel) -> Result<(), CioError> {
        let irq = sch.irq;
        let (cc, schib) = self.machine.store_subchannel(irq);
        if cc == ConditionCode::NotOperational {
            sch.flags.remove(UsageFlags::OPER);
            return Err(CioError::DeviceGone);
        }
        sch.schib = schib;
        if sch.schib.pmcw.ena {
            return Ok(());
        }

        sch.schib.pmcw.ena = true;
        if !sch.flags.contains(UsageFlags::SYNCIO) {
            sch.schib.pmcw.isc = self.config.default_isc;
        }

        for _ in 0..self.config.enable_retries {
            match self.machine.modify_subchannel(irq, &sch.schib) {
                ConditionCode::Success => {
                    sch.flags.insert(UsageFlags::OPER);
                    return Ok(());
                }
                ConditionCode::StatusPending => {
                    self.process_pending_inline(sch);
                }
                ConditionCode::Busy => {
                    self.machine.delay(self.config.busy_delay_us);
                }
                ConditionCode::NotOperational => {
                    sch.schib.pmcw.ena = false;
                    sch.flags.remove(UsageFlags::OPER);
                    return Err(CioError::DeviceGone);
                }
                other => {
                    sch.schib.pmcw.ena = false;
                    log::error!("enable_subchannel({}) - msch() returned cc {}", irq, other.raw());
                    return Err(CioError::UnexpectedConditionCode(other.raw()));
                }
            }
        }

        sch.schib.pmcw.ena = false;
        log::error!(
            "enable_subchannel({}) - device {:04X} hard down, retry count exceeded",
            irq,
            sch.schib.pmcw.dev
        );
        Err(CioError::IoError)
    }

    /// Disables the subchannel for I/O interruptions.
    ///
    /// A subchannel that turned out not operational is marked for deferred
    /// disabling at its next interruption.
    pub(crate) fn disable_subchannel_locked(&self, sch: &mut Subchannel) -> Result<(), CioError> {
        let irq = sch.irq;
        if sch.flags.contains(UsageFlags::BUSY) {
            return Err(CioError::Busy);
        }

        let (cc, schib) = self.machine.store_subchannel(irq);
        if cc == ConditionCode::NotOperational {
            sch.flags.remove(UsageFlags::OPER);
            sch.flags.insert(UsageFlags::D_DISABLE);
            return Ok(());
        }
        sch.schib = schib;
        if !sch.schib.pmcw.ena {
            return Ok(());
        }

        sch.schib.pmcw.ena = false;
        for _ in 0..self.config.disable_retries {
            match self.machine.modify_subchannel(irq, &sch.schib) {
                ConditionCode::Success => return Ok(()),
                ConditionCode::StatusPending => {
                    // must not happen while disabling, but the status has to go
                    self.process_pending_inline(sch);
                    if sch.flags.contains(UsageFlags::BUSY) {
                        break;
                    }
                }
                ConditionCode::Busy => {
                    self.machine.delay(self.config.busy_delay_us);
                }
                ConditionCode::NotOperational => {
                    sch.flags.remove(UsageFlags::OPER);
                    sch.flags.insert(UsageFlags::D_DISABLE);
                    return Ok(());
                }
                other => {
                    sch.schib.pmcw.ena = true;
                    log::error!("disable_subchannel({}) - msch() returned cc {}", irq, other.raw());
                    return Err(CioError::UnexpectedConditionCode(other.raw()));
                }
            }
        }

        sch.schib.pmcw.ena = true;
        Err(CioError::Busy)
    }

    /// Processes a status found pending by an instruction without calling the
    /// driver's handler.
    pub(crate) fn process_pending_inline(&self, sch: &mut Subchannel) {
        let nested = sch.flags.contains(UsageFlags::S_PEND);
        sch.flags.insert(UsageFlags::S_PEND);
        if let Err(e) = self.process_locked(sch) {
            log::error!("cio({}) - pending status: {}", sch.irq, e);
        }
        if !nested {
            sch.flags.remove(UsageFlags::S_PEND);
        }
    }

    /// Moves the subchannel to the synchronous interruption subclass and
    /// narrows the CPU mask to it and the console subclass.
    pub(crate) fn enable_cpu_sync_isc<'a>(
        &'a self,
        sch: &mut Subchannel,
    ) -> Result<SyncSection<'a>, CioError> {
        if sch.flags.contains(UsageFlags::SYNCIO) {
            return Ok(SyncSection::nested());
        }

        let guard = self.sync_lock.lock();
        // Nested requests issued while the subclass is being switched must
        // not try to take the lock again.
        sch.flags.insert(UsageFlags::SYNCIO);

        let irq = sch.irq;
        let default_isc = sch.schib.pmcw.isc;
        sch.schib.pmcw.isc = self.config.sync_isc;

        let mut result = Err(CioError::Busy);
        for _ in 0..self.config.msch_retries {
            match self.machine.modify_subchannel(irq, &sch.schib) {
                ConditionCode::Success => {
                    result = Ok(());
                    break;
                }
                ConditionCode::StatusPending => {
                    self.process_pending_inline(sch);
                }
                ConditionCode::Busy => {
                    self.machine.delay(self.config.busy_delay_us);
                }
                ConditionCode::NotOperational => {
                    sch.flags.remove(UsageFlags::OPER);
                    result = Err(CioError::DeviceGone);
                    break;
                }
                other => {
                    result = Err(CioError::UnexpectedConditionCode(other.raw()));
                    break;
                }
            }
        }

        match result {
            Ok(()) => {
                let saved = self.machine.set_isc_mask(self.config.sync_mask());
                log::trace!("cio({}) - synchronous subclass enabled", irq);
                Ok(SyncSection {
                    guard: Some(guard),
                    saved_mask: Some(saved),
                })
            }
            Err(e) => {
                log::debug!("enable_cpu_sync_isc({}) failed: {}", irq, e);
                sch.schib.pmcw.isc = default_isc;
                sch.flags.remove(UsageFlags::SYNCIO);
                Err(e)
            }
        }
    }

    /// Restores the subclass and CPU mask saved by [`Self::enable_cpu_sync_isc`].
    pub(crate) fn disable_cpu_sync_isc(&self, sch: &mut Subchannel, section: SyncSection<'_>) {
        if section.is_nested() {
            return;
        }

        let irq = sch.irq;
        sch.schib.pmcw.isc = self.config.default_isc;
        for _ in 0..self.config.msch_retries {
            match self.machine.modify_subchannel(irq, &sch.schib) {
                ConditionCode::Success => break,
                ConditionCode::StatusPending => self.process_pending_inline(sch),
                ConditionCode::Busy => self.machine.delay(self.config.busy_delay_us),
                ConditionCode::NotOperational => {
                    sch.flags.remove(UsageFlags::OPER);
                    break;
                }
                other => {
                    log::error!("disable_cpu_sync_isc({}) - msch() returned cc {}", irq, other.raw());
                    break;
                }
            }
        }

        if let Some(mask) = section.saved_mask {
            self.machine.set_isc_mask(mask);
        }
        sch.flags.remove(UsageFlags::SYNCIO);
        drop(section.guard);
        log::trace!("cio({}) - synchronous subclass disabled", irq);
    }
}
