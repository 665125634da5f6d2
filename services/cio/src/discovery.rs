//! # Device Discovery
//!
//! Boot-time subchannel scan and device identification.
//!
//! The scan walks subchannel numbers upward with store-subchannel until the
//! channel subsystem reports condition code 3 or the configured bound is
//! reached. Every device found is prepared (interruption subclass, concurrent
//! sense, multipath mode) but left disabled; it is enabled only when a driver
//! registers a handler.

use alloc::vec::Vec;

use crate::ccw::{Ccw, CcwFlags, ChannelProgram, DataBuffer, IoFlags, CCW_CMD_SENSE_ID};
use crate::config::{CioConfig, MAX_SUBCHANNELS};
use crate::css::ChannelSubsystem;
use crate::devstat::{SenseId, SENSE_ID_LEN, SNS0_CMD_REJECT};
use crate::hw::{ConditionCode, Diag210, Machine, SubchannelId};
use crate::schib::{DeviceStatus, Schib};
use crate::subchannel::{Subchannel, UsageFlags};
use crate::{CioError, SENSE_ID_INTPARM};

/// Scans the subchannel set.
///
/// Terminates at the first condition code 3 and never looks beyond
/// [`MAX_SUBCHANNELS`] or `config.max_subchannels`, whichever is lower.
pub(crate) fn scan_subchannels(machine: &dyn Machine, config: &CioConfig) -> Vec<Subchannel> {
    let bound = config.max_subchannels.min(MAX_SUBCHANNELS);
    let mut subchannels = Vec::new();

    let mut irq = 0u32;
    while irq < bound {
        let id = SubchannelId(irq as u16);
        let (cc, schib) = machine.store_subchannel(id);
        let mut sch = match cc {
            ConditionCode::Success => Subchannel::new(id, schib),
            ConditionCode::NotOperational => break,
            other => {
                log::warn!("scan({}) - stsch returned cc {}", id, other.raw());
                Subchannel::new(id, Schib::default())
            }
        };
        if sch.is_device() {
            validate_subchannel(machine, config, &mut sch);
        }
        subchannels.push(sch);
        irq += 1;
    }

    subchannels
}

/// Prepares a device subchannel for later use.
fn validate_subchannel(machine: &dyn Machine, config: &CioConfig, sch: &mut Subchannel) {
    let irq = sch.irq;
    sch.opm = sch.schib.pmcw.operational_paths();

    let level = if config.show_messages {
        log::Level::Info
    } else {
        log::Level::Debug
    };
    let pmcw = &mut sch.schib.pmcw;
    log::log!(
        level,
        "Detected device {:04X} on subchannel {} - PIM = {:02X}, PAM = {:02X}, POM = {:02X}",
        pmcw.dev,
        irq,
        pmcw.pim,
        pmcw.pam,
        pmcw.pom
    );

    pmcw.intparm = u32::from(irq.0);
    pmcw.isc = config.default_isc;
    pmcw.ena = false;
    pmcw.csense = config.concurrent_sense;
    pmcw.mp = sch.opm.count_ones() > 1;

    for _ in 0..config.msch_retries {
        match machine.modify_subchannel(irq, &sch.schib) {
            ConditionCode::Success => {
                sch.flags.insert(UsageFlags::OPER);
                if sch.schib.pmcw.csense {
                    sch.flags.insert(UsageFlags::CONSNS);
                }
                return;
            }
            ConditionCode::StatusPending => {
                // Nobody owns the status yet, just clear it
                let _ = machine.test_subchannel(irq);
            }
            ConditionCode::Busy => {
                sch.flags.remove(UsageFlags::OPER);
                machine.delay(config.busy_delay_us);
            }
            ConditionCode::NotOperational => {
                sch.flags.remove(UsageFlags::OPER);
                return;
            }
            ConditionCode::BrokenHardware if sch.schib.pmcw.csense => {
                log::warn!(
                    "validate_subchannel({}) - device {:04X} rejects concurrent sense",
                    irq,
                    sch.schib.pmcw.dev
                );
                sch.schib.pmcw.csense = false;
            }
            other => {
                log::error!("validate_subchannel({}) - msch returned cc {}", irq, other.raw());
                sch.flags.remove(UsageFlags::OPER);
                return;
            }
        }
    }

    log::warn!(
        "validate_subchannel({}) - device {:04X} not ready, retry count exceeded",
        irq,
        sch.schib.pmcw.dev
    );
    sch.flags.remove(UsageFlags::OPER);
}

/// Control unit type for a virtual device described by diagnose 210.
fn diag210_cu_type(d: &Diag210) -> Option<u16> {
    let cu_type = match (d.vrdcvcla, d.vrdcvtyp) {
        // console
        (0x80, 0x00) => 0x3215,
        // graphics
        (0x40, 0xC0) => 0x5080,
        // readers
        (0x20, 0x84) => 0x3505,
        (0x20, 0x82) => 0x2540,
        // punches and printers
        (0x10, 0x84) => 0x3525,
        (0x10, 0x82) => 0x2540,
        (0x10, 0x4F | 0x4E | 0x48) => 0x3820,
        (0x10, 0x4D | 0x49 | 0x45) => 0x3800,
        (0x10, 0x4B) => 0x4248,
        (0x10, 0x4A) => 0x4245,
        (0x10, 0x47) => 0x3262,
        (0x10, 0x43) => 0x3203,
        (0x10, 0x42) => 0x3211,
        (0x10, 0x41) => 0x1403,
        // channel-to-channel adapter
        (0x08, 0x82) => 0x3088,
        _ => return None,
    };
    Some(cu_type)
}

impl ChannelSubsystem {
    /// Asks the device to identify itself.
    ///
    /// Retries on status pending and unit checks other than command reject.
    /// A device that still cannot be identified is marked not operational.
    pub fn sense_id(&self, irq: SubchannelId) -> Result<SenseId, CioError> {
        let mut sch = self.lock(irq)?;
        if !sch.flags.contains(UsageFlags::OPER) {
            return Err(CioError::DeviceGone);
        }

        let mut sid = self.with_temporary_handler(&mut sch, "SID", |css, sch| css.sense_id_locked(sch))?;

        if sid.is_unknown() && self.config.hypervisor_guest {
            let devno = sch.schib.pmcw.dev;
            if let Some(cu_type) = self.machine.diag210(devno).as_ref().and_then(diag210_cu_type) {
                log::debug!("sense_id({}) - device {:04X} identified by diag 210", irq, devno);
                sid = SenseId {
                    cu_type,
                    cu_model: 0,
                    dev_type: 0,
                    dev_model: 0,
                    ..SenseId::default()
                };
            }
        }

        if sid.is_unknown() {
            log::warn!(
                "sense_id({}) - unknown device {:04X}, marked not operational",
                irq,
                sch.schib.pmcw.dev
            );
            sch.flags.remove(UsageFlags::OPER);
            return Err(CioError::DeviceGone);
        }

        sch.senseid = sid.clone();
        Ok(sid)
    }

    fn sense_id_locked(&self, sch: &mut Subchannel) -> Result<SenseId, CioError> {
        let buffer = DataBuffer::filled(SENSE_ID_LEN, 0xFF);
        let program = ChannelProgram::single(Ccw::new(CCW_CMD_SENSE_ID, CcwFlags::SLI, buffer.clone()));
        let flags = IoFlags::WAIT_FOR_INTERRUPT | IoFlags::DONT_CALL_HANDLER;

        let mut sid = SenseId::default();
        for retry in (0..self.config.sense_id_retries).rev() {
            buffer.fill(0xFF);
            match self.do_io_locked(sch, program.clone(), SENSE_ID_INTPARM, 0, flags) {
                Ok(()) => {}
                Err(CioError::DeviceGone) => break,
                Err(e) => {
                    log::debug!("sense_id({}) - start failed ({}), {} retries left", sch.irq, e, retry);
                    continue;
                }
            }

            let status = &sch.udevstat;
            if status.dstat.contains(DeviceStatus::UNIT_CHECK) {
                if status.sense_data().first().is_some_and(|s| s & SNS0_CMD_REJECT != 0) {
                    log::debug!("sense_id({}) - command rejected", sch.irq);
                    break;
                }
                log::debug!("sense_id({}) - unit check, {} retries left", sch.irq, retry);
                continue;
            }

            sid = SenseId::parse(&buffer.to_vec(SENSE_ID_LEN));
            if !sid.is_unknown() {
                break;
            }
        }

        Ok(sid)
    }

    /// Identifies every device that has no owner yet.
    ///
    /// Returns the number of devices identified.
    pub fn device_recognition(&self) -> usize {
        let mut found = 0;
        for (index, devno) in self.devnos.iter().enumerate() {
            let Some(devno) = devno else { continue };
            let irq = SubchannelId(index as u16);
            let (ready, oper) = {
                let sch = self.subchannels[index].lock();
                (sch.flags.contains(UsageFlags::READY), sch.is_operational())
            };
            if ready || !oper {
                continue;
            }

            match self.sense_id(irq) {
                Ok(sid) => {
                    found += 1;
                    let level = if self.config.show_messages {
                        log::Level::Info
                    } else {
                        log::Level::Debug
                    };
                    log::log!(
                        level,
                        "Device {:04X} on subchannel {} reports: CU Type/Mod = {:04X}/{:02X}, Dev Type/Mod = {:04X}/{:02X}",
                        devno,
                        irq,
                        sid.cu_type,
                        sid.cu_model,
                        sid.dev_type,
                        sid.dev_model
                    );
                }
                Err(e) => log::warn!("Device {:04X} on subchannel {} not identified: {}", devno, irq, e),
            }
        }
        found
    }
}
