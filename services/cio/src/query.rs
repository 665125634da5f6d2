//! # Synchronous Device Queries
//!
//! Read-device-characteristics and read-configuration-data, issued as
//! synchronous requests. A throwaway handler is installed for the duration of
//! the query if no driver owns the device yet.

use alloc::vec::Vec;

use crate::ccw::{Ccw, CcwFlags, ChannelProgram, DataBuffer, IoFlags, CCW_CMD_RCD, CCW_CMD_RDC};
use crate::css::ChannelSubsystem;
use crate::devstat::{CiwType, SNS0_CMD_REJECT};
use crate::hw::SubchannelId;
use crate::schib::DeviceStatus;
use crate::subchannel::{Subchannel, UsageFlags};
use crate::{CioError, RCD_INTPARM, RDC_INTPARM};

/// Configuration data length read when the device reported no RCD CIW.
pub const RCD_DEFAULT_LEN: usize = 256;

impl ChannelSubsystem {
    /// Reads up to `length` bytes of device characteristics.
    pub fn read_device_characteristics(
        &self,
        irq: SubchannelId,
        length: usize,
    ) -> Result<Vec<u8>, CioError> {
        self.query(irq, "RDC", CCW_CMD_RDC, length, RDC_INTPARM)
    }

    /// Reads the device's configuration data.
    ///
    /// Uses the command and length from the RCD command-information word if
    /// SenseID reported one.
    pub fn read_configuration_data(&self, irq: SubchannelId) -> Result<Vec<u8>, CioError> {
        let (cmd, length) = {
            let sch = self.lock(irq)?;
            sch.senseid
                .ciw(CiwType::ReadConfigurationData)
                .map(|ciw| (ciw.cmd, ciw.count as usize))
                .unwrap_or((CCW_CMD_RCD, RCD_DEFAULT_LEN))
        };
        self.query(irq, "RCD", cmd, length, RCD_INTPARM)
    }

    fn query(
        &self,
        irq: SubchannelId,
        name: &str,
        cmd: u8,
        length: usize,
        intparm: u32,
    ) -> Result<Vec<u8>, CioError> {
        if length == 0 || length > usize::from(u16::MAX) {
            return Err(CioError::InvalidArgument);
        }

        let mut sch = self.lock(irq)?;
        if !sch.flags.contains(UsageFlags::OPER) {
            return Err(CioError::DeviceGone);
        }
        if sch.flags.contains(UsageFlags::BUSY) {
            return Err(CioError::Busy);
        }

        let mut data = Vec::new();
        data.try_reserve_exact(length)
            .map_err(|_| CioError::OutOfMemory)?;
        data.resize(length, 0);
        let buffer = DataBuffer::from_vec(data);
        let program = ChannelProgram::single(Ccw::new(cmd, CcwFlags::SLI, buffer.clone()));

        let count = self.with_temporary_handler(&mut sch, name, |css, sch| {
            css.query_locked(sch, program, intparm)
        })?;
        log::trace!("{}({}) - {} bytes", name, irq, count);
        Ok(buffer.to_vec(count))
    }

    /// Runs a single-CCW query program, returning the bytes transferred.
    fn query_locked(
        &self,
        sch: &mut Subchannel,
        program: ChannelProgram,
        intparm: u32,
    ) -> Result<usize, CioError> {
        let requested = program.ccws().first().map_or(0, |ccw| usize::from(ccw.count));
        let flags = IoFlags::WAIT_FOR_INTERRUPT | IoFlags::DONT_CALL_HANDLER;

        for retry in (0..self.config.query_retries).rev() {
            match self.do_io_locked(sch, program.clone(), intparm, 0, flags) {
                Ok(()) => {}
                Err(CioError::DeviceGone) => return Err(CioError::DeviceGone),
                Err(e) => {
                    log::debug!("query({}) - start failed ({}), {} retries left", sch.irq, e, retry);
                    continue;
                }
            }

            let status = &sch.udevstat;
            if status.dstat.contains(DeviceStatus::UNIT_CHECK) {
                // Command not supported by the device
                if status.sense_data().first().is_some_and(|s| s & SNS0_CMD_REJECT != 0) {
                    return Err(CioError::IoError);
                }
                log::debug!("query({}) - unit check, {} retries left", sch.irq, retry);
                continue;
            }

            return Ok(requested.saturating_sub(usize::from(status.rescnt)));
        }

        Err(CioError::Busy)
    }
}
