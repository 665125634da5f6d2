//! # Subchannel Control Blocks
//!
//! Model of the hardware-visible control blocks exchanged with the channel
//! subsystem: the subchannel information block (SCHIB) read by store-subchannel
//! and written by modify-subchannel, and the interrupt response block (IRB)
//! returned by test-subchannel. Field widths follow the architecture, bit
//! positions inside each byte do not need to.

bitflags::bitflags! {
    /// Function control (SCSW fctl)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionControl: u8 {
        const START = 1 << 2;
        const HALT = 1 << 1;
        const CLEAR = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Activity control (SCSW actl)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ActivityControl: u8 {
        const RESUME_PEND = 1 << 6;
        const START_PEND = 1 << 5;
        const HALT_PEND = 1 << 4;
        const CLEAR_PEND = 1 << 3;
        const SCH_ACTIVE = 1 << 2;
        const DEV_ACTIVE = 1 << 1;
        const SUSPENDED = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Status control (SCSW stctl)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusControl: u8 {
        /// Alert status
        const ALERT = 1 << 4;
        /// Intermediate status
        const INTERMEDIATE = 1 << 3;
        /// Primary status (channel end)
        const PRIMARY = 1 << 2;
        /// Secondary status (device end)
        const SECONDARY = 1 << 1;
        /// Status pending
        const STATUS_PEND = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Device status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u8 {
        const ATTENTION = 0x80;
        const STATUS_MODIFIER = 0x40;
        const CONTROL_UNIT_END = 0x20;
        const BUSY = 0x10;
        const CHANNEL_END = 0x08;
        const DEVICE_END = 0x04;
        const UNIT_CHECK = 0x02;
        const UNIT_EXCEPTION = 0x01;
    }
}

bitflags::bitflags! {
    /// Subchannel (channel) status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelStatus: u8 {
        const PCI = 0x80;
        const INCORRECT_LENGTH = 0x40;
        const PROGRAM_CHECK = 0x20;
        const PROTECTION_CHECK = 0x10;
        const CHANNEL_DATA_CHECK = 0x08;
        const CHANNEL_CONTROL_CHECK = 0x04;
        const INTERFACE_CONTROL_CHECK = 0x02;
        const CHAINING_CHECK = 0x01;
    }
}

/// Path management control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pmcw {
    /// Interruption parameter
    pub intparm: u32,
    /// Interruption subclass
    pub isc: u8,
    /// Enabled for I/O interrupts
    pub ena: bool,
    /// Multipath mode
    pub mp: bool,
    /// Device number valid
    pub dnv: bool,
    /// Device number
    pub dev: u16,
    /// Logical path mask
    pub lpm: u8,
    /// Path not operational mask
    pub pnom: u8,
    /// Last path used mask
    pub lpum: u8,
    /// Path installed mask
    pub pim: u8,
    /// Path operational mask
    pub pom: u8,
    /// Path available mask
    pub pam: u8,
    /// Channel path identifiers
    pub chpid: [u8; 8],
    /// Subchannel type (0 = I/O subchannel)
    pub st: u8,
    /// Concurrent sense
    pub csense: bool,
}

impl Pmcw {
    /// Paths that are installed, available and operational.
    pub fn operational_paths(&self) -> u8 {
        self.pim & self.pam & self.pom
    }
}

/// Subchannel status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scsw {
    /// Subchannel key
    pub key: u8,
    /// Extended status word format
    pub eswf: bool,
    /// Deferred condition code
    pub cc: u8,
    /// Extended control (extended status information present)
    pub ectl: bool,
    /// Path not operational
    pub pno: bool,
    pub fctl: FunctionControl,
    pub actl: ActivityControl,
    pub stctl: StatusControl,
    /// Channel program address
    pub cpa: u32,
    pub dstat: DeviceStatus,
    pub cstat: ChannelStatus,
    /// Residual byte count
    pub count: u16,
}

/// Subchannel information block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Schib {
    pub pmcw: Pmcw,
    pub scsw: Scsw,
}

/// Extended report word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Erw {
    /// Concurrent sense data stored in the ECW
    pub cons: bool,
    /// Number of valid sense bytes
    pub scnt: u8,
}

/// Extended status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Esw {
    pub erw: Erw,
    /// Last path used mask
    pub lpum: u8,
}

/// Number of bytes in the extended control word (and maximum sense length).
pub const ECW_SIZE: usize = 32;

/// Interrupt response block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Irb {
    pub scsw: Scsw,
    pub esw: Esw,
    /// Extended control word (concurrent sense data)
    pub ecw: [u8; ECW_SIZE],
}

impl Irb {
    /// Sense data was delivered together with this interruption.
    ///
    /// The ERW is only meaningful when extended control is set and the status
    /// is not a plain status-pending without ESW, nor an unsuspended
    /// intermediate status.
    pub fn has_concurrent_sense(&self) -> bool {
        let scsw = &self.scsw;
        if !scsw.ectl {
            return false;
        }
        if scsw.stctl == StatusControl::STATUS_PEND && !scsw.eswf {
            return false;
        }
        if scsw.stctl == StatusControl::STATUS_PEND | StatusControl::INTERMEDIATE
            && !scsw.actl.contains(ActivityControl::SUSPENDED)
        {
            return false;
        }
        self.esw.erw.cons
    }

    /// The interruption terminates the current function.
    pub fn is_ending_status(&self) -> bool {
        let stctl = self.scsw.stctl;
        stctl.contains(StatusControl::SECONDARY)
            || stctl == StatusControl::ALERT | StatusControl::STATUS_PEND
            || (self.scsw.fctl == FunctionControl::HALT && stctl == StatusControl::STATUS_PEND)
    }
}
