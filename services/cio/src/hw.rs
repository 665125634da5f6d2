//! # Channel Instruction Wrappers
//!
//! The privileged channel-subsystem instructions are reached through two
//! traits. [`ChannelInstructions`] covers the six subchannel instructions and
//! nothing else; [`Machine`] adds the CPU-side collaborators the subsystem
//! needs (pending-interruption test, interruption-subclass mask, hypervisor
//! device query and a busy-wait delay).
//!
//! A real backend issues `ssch`/`hsch`/`rsch`/`stsch`/`msch`/`tsch`/`tpi`;
//! none of the callers retry on their own here, retry policy lives in the
//! dispatch and discovery layers.

use core::fmt;

use crate::ccw::Orb;
use crate::schib::{Irb, Schib};

/// Index of a subchannel within the subchannel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SubchannelId(pub u16);

impl SubchannelId {
    pub const fn new(irq: u16) -> Self {
        Self(irq)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubchannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Normalized condition code of a channel instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCode {
    /// cc 0: function initiated / status stored
    Success,
    /// cc 1: status pending
    StatusPending,
    /// cc 2: busy / function not applicable
    Busy,
    /// cc 3: not operational
    NotOperational,
    /// Program check on store/modify subchannel (operand exception)
    BrokenHardware,
    /// Anything the architecture does not define
    Unexpected(u8),
}

impl ConditionCode {
    /// Maps a raw condition code.
    pub const fn from_raw(cc: u8) -> Self {
        match cc {
            0 => Self::Success,
            1 => Self::StatusPending,
            2 => Self::Busy,
            3 => Self::NotOperational,
            other => Self::Unexpected(other),
        }
    }

    /// Raw value; a program check reports the operand-exception code.
    pub const fn raw(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::StatusPending => 1,
            Self::Busy => 2,
            Self::NotOperational => 3,
            Self::BrokenHardware => PGMCHK_OPERAND_EXC,
            Self::Unexpected(cc) => cc,
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Program interruption code of an operand exception.
pub const PGMCHK_OPERAND_EXC: u8 = 0x15;

/// I/O interruption code as stored by an interruption or `tpi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptionCode {
    /// Subchannel with the pending interruption
    pub irq: SubchannelId,
    /// Interruption parameter from the ORB
    pub intparm: u32,
}

/// Virtual device description returned by diagnose 210.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diag210 {
    /// Device number
    pub devno: u16,
    /// Virtual device class
    pub vrdcvcla: u8,
    /// Virtual device type
    pub vrdcvtyp: u8,
    /// Virtual device status
    pub vrdcvsta: u8,
    /// Virtual device flags
    pub vrdcvfla: u8,
    /// Real device class
    pub vrdcrccl: u8,
    /// Real device type
    pub vrdcrtyp: u8,
    /// Real device model
    pub vrdcrmod: u8,
}

/// The six subchannel instructions.
pub trait ChannelInstructions: Send + Sync {
    /// Start subchannel (`ssch`).
    fn start_subchannel(&self, irq: SubchannelId, orb: &Orb) -> ConditionCode;

    /// Halt subchannel (`hsch`).
    fn halt_subchannel(&self, irq: SubchannelId) -> ConditionCode;

    /// Resume subchannel (`rsch`).
    fn resume_subchannel(&self, irq: SubchannelId) -> ConditionCode;

    /// Store subchannel (`stsch`).
    fn store_subchannel(&self, irq: SubchannelId) -> (ConditionCode, Schib);

    /// Modify subchannel (`msch`). May report [`ConditionCode::BrokenHardware`].
    fn modify_subchannel(&self, irq: SubchannelId, schib: &Schib) -> ConditionCode;

    /// Test subchannel (`tsch`). Clears the pending status.
    fn test_subchannel(&self, irq: SubchannelId) -> (ConditionCode, Irb);
}

/// CPU-level collaborators on top of the subchannel instructions.
pub trait Machine: ChannelInstructions {
    /// Test pending interruption (`tpi`): dequeues the next interruption that
    /// is enabled by the current interruption-subclass mask.
    fn test_pending_interruption(&self) -> Option<InterruptionCode>;

    /// Loads the I/O interruption-subclass mask (control register 6) and
    /// returns the previous one.
    fn set_isc_mask(&self, mask: u8) -> u8;

    /// Diagnose 210: describes a virtual device when running as a guest.
    fn diag210(&self, _devno: u16) -> Option<Diag210> {
        None
    }

    /// Busy-waits roughly `micros` microseconds.
    fn delay(&self, micros: u32) {
        for _ in 0..micros {
            core::hint::spin_loop();
        }
    }
}
