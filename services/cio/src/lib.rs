//! # S-CIO: Common Channel I/O Subsystem
//!
//! S-CIO is the layer every channel-attached device driver sits on. It owns
//! the subchannel table, issues the channel-subsystem instructions on behalf
//! of drivers and turns the interruptions posted by the channel subsystem back
//! into driver notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Device Drivers (CTC, ...)               │
//! │   register_handler / start_io / halt_io / resume_io         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────┐   ┌───────────────────────────┐  │
//! │  │   Request Dispatch    │   │ Interrupt Reconciliation  │  │
//! │  │  - busy / queue slot  │◄──┤  - status merge           │  │
//! │  │  - sync polling       │   │  - auto SENSE             │  │
//! │  └──────────┬────────────┘   │  - handler invocation     │  │
//! │             │                └────────────▲──────────────┘  │
//! │  ┌──────────▼─────────────────────────────┴──────────────┐  │
//! │  │              Subchannel Registry (arena)              │  │
//! │  └──────────▲────────────────────────────────────────────┘  │
//! │  ┌──────────┴────────────┐   ┌───────────────────────────┐  │
//! │  │   Device Discovery    │   │ Channel Instructions      │  │
//! │  │  - stsch scan         │──►│  ssch hsch rsch stsch     │  │
//! │  │  - SenseID            │   │  msch tsch (+ tpi, CR6)   │  │
//! │  └───────────────────────┘   └───────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Every subchannel record sits behind its own `spin::Mutex`. All public entry
//! points take that lock; driver handlers run with it held and receive an
//! [`IrqContext`] through which they can start, halt or resume I/O on their own
//! subchannel. Synchronous requests additionally hold the system-wide
//! synchronous-I/O lock while the CPU interruption-subclass mask is narrowed.
//! While polling, interruptions of console-subclass subchannels are processed
//! under that lock, so console devices must not use synchronous requests.
//!
//! ## Example
//!
//! ```ignore
//! let css = ChannelSubsystem::init(machine, CioConfig::default());
//! css.device_recognition();
//!
//! let irq = css.get_irq_by_devno(0x0600)?;
//! css.register_handler(irq, "ctc0", dev_id, Arc::new(|ctx, status| {
//!     if status.is_final() {
//!         // start the next transfer from inside the handler
//!         let _ = ctx.start_io(next_program(), 0, 0, IoFlags::empty());
//!     }
//! }))?;
//! css.start_io(irq, program, intparm, 0, IoFlags::empty())?;
//! ```

#![no_std]

extern crate alloc;

pub mod ccw;
pub mod config;
pub mod css;
pub mod devstat;
pub mod discovery;
pub mod dispatch;
pub mod hw;
pub mod irq;
pub mod query;
pub mod registry;
pub mod schib;
pub mod subchannel;

#[cfg(test)]
pub(crate) mod fake;

pub use ccw::{Ccw, CcwFlags, ChannelProgram, DataBuffer, IoFlags, Orb};
pub use config::CioConfig;
pub use css::ChannelSubsystem;
pub use devstat::{DevInfo, DevInfoStatus, DevStat, DevStatFlags, SenseId};
pub use hw::{ChannelInstructions, ConditionCode, InterruptionCode, Machine, SubchannelId};
pub use subchannel::{IoHandler, IrqContext, NotOperHandler, UsageFlags};

/// S-CIO version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Interruption parameter of internally issued BASIC SENSE requests ("SENS").
pub const SENSE_INTPARM: u32 = 0xE2C5_D5E2;
/// Interruption parameter of SenseID requests ("SID").
pub const SENSE_ID_INTPARM: u32 = 0x00E2_C9C4;
/// Interruption parameter of read-device-characteristics requests ("RDC").
pub const RDC_INTPARM: u32 = 0x0052_4443;
/// Interruption parameter of read-configuration-data requests ("RCD").
pub const RCD_INTPARM: u32 = 0x0052_4344;
/// Interruption parameter of the halt issued while removing a handler ("HALT").
pub const HALT_INTPARM: u32 = 0xC8C1_D3E3;

/// S-CIO errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CioError {
    /// Subchannel number outside the discovered range or without a device
    InvalidSubchannel,
    /// No subchannel matches the lookup
    NotFound,
    /// No handler is registered for the subchannel
    NotRegistered,
    /// An operation is outstanding and no queue slot is available
    Busy,
    /// The device (or the requested path) is not operational
    DeviceGone,
    /// Status was pending and resolved with an error
    IoError,
    /// Allocation failed
    OutOfMemory,
    /// Invalid argument
    InvalidArgument,
    /// Resume requested without an active request
    NotActive,
    /// The channel subsystem refused to resume (program not suspended)
    NotSuspended,
    /// A channel instruction returned a condition code outside 0..=3
    UnexpectedConditionCode(u8),
}

impl core::fmt::Display for CioError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CioError::InvalidSubchannel => write!(f, "Invalid subchannel"),
            CioError::NotFound => write!(f, "No such device"),
            CioError::NotRegistered => write!(f, "No interrupt handler registered"),
            CioError::Busy => write!(f, "Device busy"),
            CioError::DeviceGone => write!(f, "Device not operational"),
            CioError::IoError => write!(f, "I/O error"),
            CioError::OutOfMemory => write!(f, "Out of memory"),
            CioError::InvalidArgument => write!(f, "Invalid argument"),
            CioError::NotActive => write!(f, "No active I/O request"),
            CioError::NotSuspended => write!(f, "Channel program not suspended"),
            CioError::UnexpectedConditionCode(cc) => {
                write!(f, "Unexpected condition code {}", cc)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(alloc::format!("{}", CioError::Busy), "Device busy");
        assert_eq!(
            alloc::format!("{}", CioError::UnexpectedConditionCode(9)),
            "Unexpected condition code 9"
        );
    }
}
