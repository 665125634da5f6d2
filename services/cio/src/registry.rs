//! # Subchannel Registry Queries
//!
//! Lookups over the subchannel arena by subchannel number or device number.

use alloc::string::String;

use crate::css::ChannelSubsystem;
use crate::devstat::{DevInfo, DevInfoStatus, DevStat, SenseId};
use crate::hw::SubchannelId;
use crate::subchannel::{Subchannel, UsageFlags};
use crate::CioError;

impl ChannelSubsystem {
    /// Highest subchannel number found by the scan.
    pub fn highest_subchannel(&self) -> Option<SubchannelId> {
        self.subchannels
            .len()
            .checked_sub(1)
            .map(|n| SubchannelId(n as u16))
    }

    /// First subchannel with a device.
    pub fn first_subchannel(&self) -> Option<SubchannelId> {
        self.devices_from(0).next()
    }

    /// Next subchannel with a device after `irq`.
    pub fn next_subchannel(&self, irq: SubchannelId) -> Option<SubchannelId> {
        self.devices_from(irq.index() + 1).next()
    }

    fn devices_from(&self, start: usize) -> impl Iterator<Item = SubchannelId> + '_ {
        self.devnos
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, devno)| devno.is_some())
            .map(|(index, _)| SubchannelId(index as u16))
    }

    pub fn get_irq_by_devno(&self, devno: u16) -> Result<SubchannelId, CioError> {
        self.devnos
            .iter()
            .position(|d| *d == Some(devno))
            .map(|index| SubchannelId(index as u16))
            .ok_or(CioError::NotFound)
    }

    pub fn get_devno_by_irq(&self, irq: SubchannelId) -> Result<u16, CioError> {
        self.devnos
            .get(irq.index())
            .copied()
            .flatten()
            .ok_or(CioError::NotFound)
    }

    pub fn get_dev_info_by_irq(&self, irq: SubchannelId) -> Result<DevInfo, CioError> {
        let sch = self.lock(irq).map_err(|_| CioError::NotFound)?;
        Ok(dev_info(&sch))
    }

    pub fn get_dev_info_by_devno(&self, devno: u16) -> Result<DevInfo, CioError> {
        self.get_dev_info_by_irq(self.get_irq_by_devno(devno)?)
    }

    /// Status last reported to the subchannel's driver.
    pub fn devstat(&self, irq: SubchannelId) -> Result<DevStat, CioError> {
        Ok(self.lock(irq)?.devstat().clone())
    }

    pub fn usage_flags(&self, irq: SubchannelId) -> Result<UsageFlags, CioError> {
        Ok(self.lock(irq)?.flags())
    }

    /// A request waits in the queue slot.
    pub fn is_queued(&self, irq: SubchannelId) -> Result<bool, CioError> {
        Ok(self.lock(irq)?.is_queued())
    }

    /// Operational path mask.
    pub fn opm(&self, irq: SubchannelId) -> Result<u8, CioError> {
        Ok(self.lock(irq)?.opm())
    }

    /// Name of the registered handler.
    pub fn owner(&self, irq: SubchannelId) -> Result<Option<String>, CioError> {
        Ok(self.lock(irq)?.owner().map(String::from))
    }

    pub fn senseid(&self, irq: SubchannelId) -> Result<SenseId, CioError> {
        Ok(self.lock(irq)?.senseid().clone())
    }
}

fn dev_info(sch: &Subchannel) -> DevInfo {
    let mut status = DevInfoStatus::empty();
    if !sch.is_operational() {
        status |= DevInfoStatus::NOT_OPER;
    }
    if sch.flags.contains(UsageFlags::READY) {
        status |= DevInfoStatus::DEVICE_OWNED;
    }
    if sch.senseid.is_unknown() {
        status |= DevInfoStatus::UNKNOWN_DEV;
    }
    DevInfo {
        irq: sch.irq.0,
        status,
        devno: sch.schib.pmcw.dev,
        sid_data: sch.senseid.clone(),
    }
}
