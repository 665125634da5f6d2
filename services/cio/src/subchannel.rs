//! # Subchannel Records
//!
//! One [`Subchannel`] per scanned subchannel, owned by the registry arena.
//! Fields are mutated only with the record's lock held.

use alloc::string::String;
use alloc::sync::Arc;

use crate::ccw::{ChannelProgram, DataBuffer, IoFlags};
use crate::css::ChannelSubsystem;
use crate::devstat::{DevStat, SenseId, SENSE_MAX_COUNT};
use crate::hw::SubchannelId;
use crate::schib::{Schib, StatusControl};
use crate::CioError;

bitflags::bitflags! {
    /// Internal usage flags of a subchannel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsageFlags: u32 {
        /// A request is outstanding
        const BUSY = 1 << 0;
        /// The outstanding request was started by `start_io`
        const DOIO = 1 << 1;
        /// A halt function is outstanding
        const HALTIO = 1 << 2;
        /// Device is operational
        const OPER = 1 << 3;
        /// A handler is registered
        const READY = 1 << 4;
        /// Early notification at primary status
        const FAST = 1 << 5;
        /// Report every interruption
        const REPALL = 1 << 6;
        /// Primary status seen, waiting for final status
        const W4FINAL = 1 << 7;
        /// Internal BASIC SENSE in flight
        const W4SENSE = 1 << 8;
        /// Unit check seen before final status, sense deferred
        const DELSENSE = 1 << 9;
        /// Inline status-pending processing, handler suppressed
        const S_PEND = 1 << 10;
        /// Subchannel is using the synchronous interruption subclass
        const SYNCIO = 1 << 11;
        /// Handler removal in progress
        const UNREADY = 1 << 12;
        /// Disable at the next interruption
        const D_DISABLE = 1 << 13;
        /// Concurrent sense facility enabled
        const CONSNS = 1 << 14;
        /// Do not call the handler for the current request
        const REPNONE = 1 << 15;
    }
}

/// Driver interrupt handler.
///
/// Runs with the subchannel lock held; I/O on the same subchannel must be
/// issued through the [`IrqContext`].
pub type IoHandler = Arc<dyn Fn(&mut IrqContext<'_>, &DevStat) + Send + Sync>;

/// Called when a subchannel is found not operational: `(irq, devno)`.
pub type NotOperHandler = Arc<dyn Fn(SubchannelId, u16) + Send + Sync>;

/// A registered handler.
#[derive(Clone)]
pub struct IrqAction {
    /// Owner name
    pub name: String,
    /// Token identifying the owner
    pub dev_id: u64,
    pub handler: IoHandler,
    pub not_oper: Option<NotOperHandler>,
}

impl core::fmt::Debug for IrqAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqAction")
            .field("name", &self.name)
            .field("dev_id", &self.dev_id)
            .field("not_oper", &self.not_oper.is_some())
            .finish()
    }
}

/// Request accepted while early-notified I/O waits for final status.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub program: ChannelProgram,
    pub intparm: u32,
    pub lpm: u8,
    pub flags: IoFlags,
}

/// Per-subchannel state.
#[derive(Debug)]
pub struct Subchannel {
    pub(crate) irq: SubchannelId,
    /// Last stored/modified SCHIB
    pub(crate) schib: Schib,
    /// Status accumulated for the current request
    pub(crate) devstat: DevStat,
    /// Status last handed to the driver
    pub(crate) udevstat: DevStat,
    pub(crate) flags: UsageFlags,
    /// Operational path mask
    pub(crate) opm: u8,
    /// Path mask used for the current request
    pub(crate) ulpm: u8,
    /// Status control accumulated since the last ending status
    pub(crate) stctl: StatusControl,
    pub(crate) action: Option<IrqAction>,
    pub(crate) queued: Option<QueuedRequest>,
    /// Program the channel may still be executing
    pub(crate) active: Option<ChannelProgram>,
    /// Target of internally issued BASIC SENSE
    pub(crate) sense_buffer: DataBuffer,
    pub(crate) senseid: SenseId,
}

impl Subchannel {
    /// Record for a subchannel reported by store-subchannel.
    pub(crate) fn new(irq: SubchannelId, schib: Schib) -> Self {
        let devstat = DevStat {
            devno: schib.pmcw.dev,
            ..DevStat::default()
        };
        Self {
            irq,
            schib,
            udevstat: devstat.clone(),
            devstat,
            flags: UsageFlags::empty(),
            opm: schib.pmcw.operational_paths(),
            ulpm: 0,
            stctl: StatusControl::empty(),
            action: None,
            queued: None,
            active: None,
            sense_buffer: DataBuffer::new(SENSE_MAX_COUNT),
            senseid: SenseId::default(),
        }
    }

    pub fn irq(&self) -> SubchannelId {
        self.irq
    }

    /// Device number, if the subchannel has a valid one.
    pub fn devno(&self) -> Option<u16> {
        self.schib.pmcw.dnv.then_some(self.schib.pmcw.dev)
    }

    /// I/O subchannel with a valid device number.
    pub fn is_device(&self) -> bool {
        self.schib.pmcw.dnv && self.schib.pmcw.st == 0
    }

    pub fn flags(&self) -> UsageFlags {
        self.flags
    }

    pub fn is_busy(&self) -> bool {
        self.flags.contains(UsageFlags::BUSY)
    }

    pub fn is_operational(&self) -> bool {
        self.flags.contains(UsageFlags::OPER)
    }

    /// A request is waiting in the queue slot.
    pub fn is_queued(&self) -> bool {
        self.queued.is_some()
    }

    pub fn opm(&self) -> u8 {
        self.opm
    }

    pub fn schib(&self) -> &Schib {
        &self.schib
    }

    /// Status last reported to the driver.
    pub fn devstat(&self) -> &DevStat {
        &self.udevstat
    }

    pub fn senseid(&self) -> &SenseId {
        &self.senseid
    }

    pub fn owner(&self) -> Option<&str> {
        self.action.as_ref().map(|a| a.name.as_str())
    }
}

/// Access to a locked subchannel from inside its interrupt handler.
pub struct IrqContext<'a> {
    pub(crate) css: &'a ChannelSubsystem,
    pub(crate) sch: &'a mut Subchannel,
}

impl<'a> IrqContext<'a> {
    pub(crate) fn new(css: &'a ChannelSubsystem, sch: &'a mut Subchannel) -> Self {
        Self { css, sch }
    }

    pub fn irq(&self) -> SubchannelId {
        self.sch.irq
    }

    pub fn devno(&self) -> u16 {
        self.sch.schib.pmcw.dev
    }

    pub fn flags(&self) -> UsageFlags {
        self.sch.flags
    }

    pub fn is_queued(&self) -> bool {
        self.sch.is_queued()
    }

    /// Starts (or queues) a channel program, see [`ChannelSubsystem::start_io`].
    pub fn start_io(
        &mut self,
        program: ChannelProgram,
        intparm: u32,
        lpm: u8,
        flags: IoFlags,
    ) -> Result<(), CioError> {
        self.css.do_io_locked(self.sch, program, intparm, lpm, flags)
    }

    /// Halts the current request, see [`ChannelSubsystem::halt_io`].
    pub fn halt_io(&mut self, intparm: u32, flags: IoFlags) -> Result<(), CioError> {
        self.css.halt_io_locked(self.sch, intparm, flags)
    }

    /// Resumes a suspended channel program, see [`ChannelSubsystem::resume_io`].
    pub fn resume_io(&mut self) -> Result<(), CioError> {
        self.css.resume_io_locked(self.sch)
    }
}
