//! # Device Status
//!
//! Driver-visible status snapshots and device identification data.

use alloc::vec::Vec;

use crate::schib::{ChannelStatus, DeviceStatus, Irb, ECW_SIZE};

/// Maximum number of sense bytes kept per device.
pub const SENSE_MAX_COUNT: usize = ECW_SIZE;

/// Sense byte 0: command reject.
pub const SNS0_CMD_REJECT: u8 = 0x80;
/// Sense byte 0: intervention required.
pub const SNS0_INTERVENTION_REQ: u8 = 0x40;
/// Sense byte 0: bus out check.
pub const SNS0_BUS_OUT_CHECK: u8 = 0x20;
/// Sense byte 0: equipment check.
pub const SNS0_EQUIPMENT_CHECK: u8 = 0x10;
/// Sense byte 0: data check.
pub const SNS0_DATA_CHECK: u8 = 0x08;
/// Sense byte 0: overrun.
pub const SNS0_OVERRUN: u8 = 0x04;

bitflags::bitflags! {
    /// Status flags reported with a [`DevStat`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DevStatFlags: u32 {
        /// Sense data is available
        const SENSE_AVAIL = 0x0000_0001;
        /// Device (or requested path) not operational
        const NOT_OPER = 0x0000_0002;
        /// A start function was performed
        const START_FUNCTION = 0x0000_0004;
        /// A halt function was performed
        const HALT_FUNCTION = 0x0000_0008;
        /// Status was pending when the function was issued
        const STATUS_PENDING = 0x0000_0010;
        /// Final status for the request
        const FINAL_STATUS = 0x8000_0000;
    }
}

/// Status of a device as seen by its driver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DevStat {
    /// Device number
    pub devno: u16,
    /// Interruption parameter of the request
    pub intparm: u32,
    /// Accumulated channel status
    pub cstat: ChannelStatus,
    /// Accumulated device status
    pub dstat: DeviceStatus,
    /// Last path used mask
    pub lpum: u8,
    pub flag: DevStatFlags,
    /// Channel program address of the last primary/intermediate status
    pub cpa: u32,
    /// Residual count of the last primary/intermediate status
    pub rescnt: u16,
    /// Number of valid sense bytes
    pub scnt: u8,
    /// Last interrupt response block
    pub irb: Irb,
    /// Sense bytes
    pub sense: [u8; SENSE_MAX_COUNT],
}

impl DevStat {
    /// Status of a request that has not received any interruption yet.
    pub(crate) fn reset_for_start(&mut self, intparm: u32) {
        self.intparm = intparm;
        self.cstat = ChannelStatus::empty();
        self.dstat = DeviceStatus::empty();
        self.lpum = 0;
        self.flag = DevStatFlags::START_FUNCTION;
        self.scnt = 0;
        self.irb = Irb::default();
    }

    /// Valid sense bytes.
    pub fn sense_data(&self) -> &[u8] {
        let n = (self.scnt as usize).min(SENSE_MAX_COUNT);
        &self.sense[..n]
    }

    pub fn is_final(&self) -> bool {
        self.flag.contains(DevStatFlags::FINAL_STATUS)
    }
}

/// Command information word reported after the SenseID basic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ciw {
    /// Command type
    pub ct: CiwType,
    /// Command code
    pub cmd: u8,
    /// Byte count
    pub count: u16,
}

/// Kind of command described by a [`Ciw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiwType {
    /// Read configuration data
    ReadConfigurationData,
    /// Set interface identifier
    SetInterfaceId,
    /// Read node identifier
    ReadNodeId,
    Other(u8),
}

impl CiwType {
    fn from_raw(ct: u8) -> Self {
        match ct {
            0 => Self::ReadConfigurationData,
            1 => Self::SetInterfaceId,
            2 => Self::ReadNodeId,
            other => Self::Other(other),
        }
    }
}

/// Maximum number of CIWs kept per device.
pub const MAX_CIWS: usize = 8;

/// Length of the SenseID data area.
pub const SENSE_ID_LEN: usize = 8 + 4 * MAX_CIWS;

/// Device identification from SenseID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseId {
    /// Always 0xFF
    pub reserved: u8,
    /// Control unit type
    pub cu_type: u16,
    /// Control unit model
    pub cu_model: u8,
    /// Device type
    pub dev_type: u16,
    /// Device model
    pub dev_model: u8,
    /// Extended command information
    pub ciws: Vec<Ciw>,
}

impl Default for SenseId {
    fn default() -> Self {
        Self {
            reserved: 0xFF,
            cu_type: 0xFFFF,
            cu_model: 0xFF,
            dev_type: 0xFFFF,
            dev_model: 0xFF,
            ciws: Vec::new(),
        }
    }
}

impl SenseId {
    /// Parses SenseID data as stored by the device. Missing bytes read as 0xFF.
    pub fn parse(data: &[u8]) -> Self {
        let byte = |i: usize| data.get(i).copied().unwrap_or(0xFF);
        let word = |i: usize| u16::from_be_bytes([byte(i), byte(i + 1)]);

        let mut ciws = Vec::new();
        for chunk in data.get(8..).unwrap_or(&[]).chunks_exact(4).take(MAX_CIWS) {
            // Entry type 01b marks a valid CIW
            if chunk[0] >> 6 != 0b01 {
                break;
            }
            ciws.push(Ciw {
                ct: CiwType::from_raw(chunk[0] & 0x0F),
                cmd: chunk[1],
                count: u16::from_be_bytes([chunk[2], chunk[3]]),
            });
        }

        Self {
            reserved: byte(0),
            cu_type: word(1),
            cu_model: byte(3),
            dev_type: word(4),
            dev_model: byte(6),
            ciws,
        }
    }

    /// The device did not identify itself.
    pub fn is_unknown(&self) -> bool {
        self.cu_type == 0xFFFF
    }

    /// CIW for the given command type.
    pub fn ciw(&self, ct: CiwType) -> Option<Ciw> {
        self.ciws.iter().copied().find(|c| c.ct == ct)
    }
}

bitflags::bitflags! {
    /// Status bits of [`DevInfo`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DevInfoStatus: u32 {
        /// Device is not operational
        const NOT_OPER = 0x01;
        /// A driver owns the device
        const DEVICE_OWNED = 0x02;
        /// SenseID did not identify the device
        const UNKNOWN_DEV = 0x04;
    }
}

/// Public device description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    /// Subchannel number
    pub irq: u16,
    pub status: DevInfoStatus,
    /// Device number
    pub devno: u16,
    /// SenseID data
    pub sid_data: SenseId,
}
