//! Scriptable channel subsystem for unit tests.
//!
//! Unscripted requests execute immediately: start-subchannel "transfers" the
//! configured response for the first CCW's command into its buffer and posts
//! channel end + device end; halt-subchannel posts halt status. Scripts
//! override the condition code of the next instruction per subchannel.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::ccw::{Ccw, CcwFlags, ChannelProgram, Orb, CCW_CMD_NOOP, CCW_CMD_SENSE_ID};
use crate::config::CioConfig;
use crate::css::ChannelSubsystem;
use crate::devstat::DevStat;
use crate::hw::{
    ChannelInstructions, ConditionCode, Diag210, InterruptionCode, Machine, SubchannelId,
};
use crate::schib::{DeviceStatus, FunctionControl, Irb, Schib, StatusControl};
use crate::subchannel::{IoHandler, IrqContext, UsageFlags};

/// SenseID data of the default device, a 3088 channel-to-channel adapter.
const DEFAULT_SENSE_ID: [u8; 8] = [0xFF, 0x30, 0x88, 0x01, 0x30, 0x88, 0x01, 0x00];

/// Scripted outcome of a start, halt or resume.
#[derive(Debug, Clone)]
pub struct Reply {
    pub cc: ConditionCode,
    /// Posted when the instruction is accepted
    pub irbs: Vec<Irb>,
}

impl Reply {
    /// Accepted, completion is posted by the test.
    pub fn accepted() -> Self {
        Self::cc(ConditionCode::Success)
    }

    pub fn cc(cc: ConditionCode) -> Self {
        Self { cc, irbs: Vec::new() }
    }
}

struct FakeDevice {
    schib: Schib,
    /// Response per command code
    data: BTreeMap<u8, Vec<u8>>,
    /// Commands ending in unit check
    rejected: BTreeSet<u8>,
    gone: bool,
    reject_csense: bool,
}

#[derive(Default)]
struct FakeState {
    installed: u32,
    devices: BTreeMap<u16, FakeDevice>,
    pending: Vec<(u16, Irb)>,
    start_replies: BTreeMap<u16, VecDeque<Reply>>,
    halt_replies: BTreeMap<u16, VecDeque<Reply>>,
    resume_replies: BTreeMap<u16, VecDeque<Reply>>,
    msch_ccs: BTreeMap<u16, VecDeque<ConditionCode>>,
    tsch_ccs: BTreeMap<u16, VecDeque<ConditionCode>>,
    orbs: Vec<(u16, Orb)>,
    halts: Vec<u16>,
    stsch_count: usize,
    isc_mask: u8,
    diag: BTreeMap<u16, Diag210>,
}

impl FakeState {
    fn post(&mut self, irq: u16, irb: Irb) {
        self.pending.push((irq, irb));
    }
}

pub struct FakeMachine {
    state: Mutex<FakeState>,
}

impl FakeMachine {
    /// `installed` subchannels, none of them with a device.
    pub fn new(installed: u32) -> Arc<Self> {
        let config = CioConfig::default();
        Arc::new(Self {
            state: Mutex::new(FakeState {
                installed,
                isc_mask: CioConfig::isc_bit(config.default_isc)
                    | CioConfig::isc_bit(config.console_isc),
                ..FakeState::default()
            }),
        })
    }

    /// Single-path devices at the given `(irq, devno)` pairs.
    pub fn with_devices(devices: &[(u16, u16)]) -> Arc<Self> {
        let installed = devices.iter().map(|&(irq, _)| u32::from(irq) + 1).max().unwrap_or(0);
        let fake = Self::new(installed);
        for &(irq, devno) in devices {
            fake.add_device(irq, devno, 0x80);
        }
        fake
    }

    pub fn add_device(&self, irq: u16, devno: u16, pim: u8) {
        let mut schib = Schib::default();
        schib.pmcw.dnv = true;
        schib.pmcw.dev = devno;
        schib.pmcw.pim = pim;
        schib.pmcw.pam = 0xFF;
        schib.pmcw.pom = 0xFF;
        schib.pmcw.lpm = pim;
        let mut data = BTreeMap::new();
        data.insert(CCW_CMD_SENSE_ID, DEFAULT_SENSE_ID.to_vec());
        self.state.lock().devices.insert(
            irq,
            FakeDevice {
                schib,
                data,
                rejected: BTreeSet::new(),
                gone: false,
                reject_csense: false,
            },
        );
    }

    fn with_device<T>(&self, irq: u16, f: impl FnOnce(&mut FakeDevice) -> T) -> T {
        let mut state = self.state.lock();
        let dev = state.devices.get_mut(&irq).expect("no such fake device");
        f(dev)
    }

    /// Response transferred for `cmd`.
    pub fn set_data(&self, irq: u16, cmd: u8, data: &[u8]) {
        self.with_device(irq, |dev| {
            dev.data.insert(cmd, data.to_vec());
        });
    }

    /// `cmd` ends in unit check without transferring data.
    pub fn reject_command(&self, irq: u16, cmd: u8) {
        self.with_device(irq, |dev| {
            dev.rejected.insert(cmd);
        });
    }

    pub fn set_sense(&self, irq: u16, sense: &[u8]) {
        self.set_data(irq, crate::ccw::CCW_CMD_BASIC_SENSE, sense);
    }

    pub fn set_gone(&self, irq: u16, gone: bool) {
        self.with_device(irq, |dev| dev.gone = gone);
    }

    pub fn set_reject_csense(&self, irq: u16, reject: bool) {
        self.with_device(irq, |dev| dev.reject_csense = reject);
    }

    pub fn set_diag210(&self, diag: Diag210) {
        self.state.lock().diag.insert(diag.devno, diag);
    }

    pub fn script_start(&self, irq: u16, reply: Reply) {
        self.state.lock().start_replies.entry(irq).or_default().push_back(reply);
    }

    pub fn script_halt(&self, irq: u16, reply: Reply) {
        self.state.lock().halt_replies.entry(irq).or_default().push_back(reply);
    }

    pub fn script_resume(&self, irq: u16, reply: Reply) {
        self.state.lock().resume_replies.entry(irq).or_default().push_back(reply);
    }

    pub fn script_msch(&self, irq: u16, cc: ConditionCode) {
        self.state.lock().msch_ccs.entry(irq).or_default().push_back(cc);
    }

    pub fn script_tsch(&self, irq: u16, cc: ConditionCode) {
        self.state.lock().tsch_ccs.entry(irq).or_default().push_back(cc);
    }

    /// Makes status pending on a subchannel.
    pub fn post(&self, irq: u16, irb: Irb) {
        self.state.lock().post(irq, irb);
    }

    /// Next interruption `tpi` would report.
    pub fn pending(&self) -> Option<InterruptionCode> {
        self.test_pending_interruption()
    }

    pub fn schib(&self, irq: u16) -> Schib {
        self.with_device(irq, |dev| dev.schib)
    }

    pub fn isc_mask(&self) -> u8 {
        self.state.lock().isc_mask
    }

    /// Accepted start requests.
    pub fn started(&self, irq: u16) -> usize {
        self.state.lock().orbs.iter().filter(|(i, _)| *i == irq).count()
    }

    /// Accepted start requests whose first CCW carries `cmd`.
    pub fn started_cmd(&self, irq: u16, cmd: u8) -> usize {
        self.state
            .lock()
            .orbs
            .iter()
            .filter(|(i, orb)| *i == irq && first_cmd(orb) == Some(cmd))
            .count()
    }

    pub fn last_orb(&self, irq: u16) -> Option<Orb> {
        self.state
            .lock()
            .orbs
            .iter()
            .rev()
            .find(|(i, _)| *i == irq)
            .map(|(_, orb)| orb.clone())
    }

    pub fn halt_count(&self, irq: u16) -> usize {
        self.state.lock().halts.iter().filter(|i| **i == irq).count()
    }

    pub fn stsch_count(&self) -> usize {
        self.state.lock().stsch_count
    }
}

fn first_cmd(orb: &Orb) -> Option<u8> {
    orb.program.ccws().first().map(|ccw| ccw.cmd_code)
}

/// Runs the first CCW of `orb` against `dev` and returns its ending status.
fn execute(dev: &FakeDevice, orb: &Orb) -> Irb {
    let mut irb = irb_final();
    irb.scsw.cpa = orb.cpa().wrapping_add(8);
    irb.esw.lpum = if orb.lpm == 0 { 0 } else { 0x80 >> orb.lpm.leading_zeros() };

    let Some(ccw) = orb.program.ccws().first() else {
        return irb;
    };
    if dev.rejected.contains(&ccw.cmd_code) {
        irb.scsw.dstat |= DeviceStatus::UNIT_CHECK;
        irb.scsw.count = ccw.count;
        return irb;
    }

    let written = match (&ccw.data, dev.data.get(&ccw.cmd_code)) {
        (Some(buffer), Some(data)) => buffer.write_at(0, data),
        _ => 0,
    };
    irb.scsw.count = ccw.count.saturating_sub(written as u16);
    irb
}

impl ChannelInstructions for FakeMachine {
    fn start_subchannel(&self, irq: SubchannelId, orb: &Orb) -> ConditionCode {
        let mut state = self.state.lock();
        let irq = irq.0;
        if state.devices.get(&irq).map_or(true, |dev| dev.gone) {
            return ConditionCode::NotOperational;
        }

        if let Some(reply) = state.start_replies.get_mut(&irq).and_then(|q| q.pop_front()) {
            if reply.cc.is_success() {
                state.orbs.push((irq, orb.clone()));
                for irb in reply.irbs {
                    state.post(irq, irb);
                }
            }
            return reply.cc;
        }

        let irb = match state.devices.get(&irq) {
            Some(dev) => execute(dev, orb),
            None => return ConditionCode::NotOperational,
        };
        state.orbs.push((irq, orb.clone()));
        state.post(irq, irb);
        ConditionCode::Success
    }

    fn halt_subchannel(&self, irq: SubchannelId) -> ConditionCode {
        let mut state = self.state.lock();
        let irq = irq.0;
        if state.devices.get(&irq).map_or(true, |dev| dev.gone) {
            return ConditionCode::NotOperational;
        }

        let reply = state
            .halt_replies
            .get_mut(&irq)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Reply {
                cc: ConditionCode::Success,
                irbs: vec![irb_halted()],
            });
        if reply.cc.is_success() {
            state.halts.push(irq);
            for irb in reply.irbs {
                state.post(irq, irb);
            }
        }
        reply.cc
    }

    fn resume_subchannel(&self, irq: SubchannelId) -> ConditionCode {
        let mut state = self.state.lock();
        let irq = irq.0;
        if state.devices.get(&irq).map_or(true, |dev| dev.gone) {
            return ConditionCode::NotOperational;
        }
        let reply = state
            .resume_replies
            .get_mut(&irq)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(Reply::accepted);
        for irb in reply.irbs {
            state.post(irq, irb);
        }
        reply.cc
    }

    fn store_subchannel(&self, irq: SubchannelId) -> (ConditionCode, Schib) {
        let mut state = self.state.lock();
        state.stsch_count += 1;
        if u32::from(irq.0) >= state.installed {
            return (ConditionCode::NotOperational, Schib::default());
        }
        match state.devices.get(&irq.0) {
            Some(dev) if dev.gone => (ConditionCode::NotOperational, Schib::default()),
            Some(dev) => (ConditionCode::Success, dev.schib),
            None => (ConditionCode::Success, Schib::default()),
        }
    }

    fn modify_subchannel(&self, irq: SubchannelId, schib: &Schib) -> ConditionCode {
        let mut state = self.state.lock();
        let irq = irq.0;
        if let Some(cc) = state.msch_ccs.get_mut(&irq).and_then(|q| q.pop_front()) {
            return cc;
        }
        let Some(dev) = state.devices.get_mut(&irq) else {
            return ConditionCode::Success;
        };
        if dev.gone {
            return ConditionCode::NotOperational;
        }
        if dev.reject_csense && schib.pmcw.csense {
            return ConditionCode::BrokenHardware;
        }

        let pmcw = &mut dev.schib.pmcw;
        pmcw.intparm = schib.pmcw.intparm;
        pmcw.isc = schib.pmcw.isc;
        pmcw.ena = schib.pmcw.ena;
        pmcw.mp = schib.pmcw.mp;
        pmcw.lpm = schib.pmcw.lpm;
        pmcw.csense = schib.pmcw.csense;
        ConditionCode::Success
    }

    fn test_subchannel(&self, irq: SubchannelId) -> (ConditionCode, Irb) {
        let mut state = self.state.lock();
        let irq = irq.0;
        if let Some(cc) = state.tsch_ccs.get_mut(&irq).and_then(|q| q.pop_front()) {
            return (cc, Irb::default());
        }
        if state.devices.get(&irq).is_some_and(|dev| dev.gone) {
            state.pending.retain(|(i, _)| *i != irq);
            return (ConditionCode::NotOperational, Irb::default());
        }
        match state.pending.iter().position(|(i, _)| *i == irq) {
            Some(index) => (ConditionCode::Success, state.pending.remove(index).1),
            None => (ConditionCode::StatusPending, Irb::default()),
        }
    }
}

impl Machine for FakeMachine {
    fn test_pending_interruption(&self) -> Option<InterruptionCode> {
        let state = self.state.lock();
        state.pending.iter().find_map(|(irq, _)| {
            let dev = state.devices.get(irq)?;
            let pmcw = &dev.schib.pmcw;
            let enabled = pmcw.ena && state.isc_mask & CioConfig::isc_bit(pmcw.isc) != 0;
            (enabled && !dev.gone).then_some(InterruptionCode {
                irq: SubchannelId(*irq),
                intparm: pmcw.intparm,
            })
        })
    }

    fn set_isc_mask(&self, mask: u8) -> u8 {
        core::mem::replace(&mut self.state.lock().isc_mask, mask)
    }

    fn diag210(&self, devno: u16) -> Option<Diag210> {
        self.state.lock().diag.get(&devno).copied()
    }

    fn delay(&self, _micros: u32) {}
}

/// Channel end + device end, start function.
pub fn irb_final() -> Irb {
    let mut irb = Irb::default();
    irb.scsw.fctl = FunctionControl::START;
    irb.scsw.stctl = StatusControl::PRIMARY | StatusControl::SECONDARY | StatusControl::STATUS_PEND;
    irb.scsw.dstat = DeviceStatus::CHANNEL_END | DeviceStatus::DEVICE_END;
    irb.esw.lpum = 0x80;
    irb
}

/// Channel end only.
pub fn irb_primary() -> Irb {
    let mut irb = irb_final();
    irb.scsw.stctl = StatusControl::PRIMARY | StatusControl::STATUS_PEND;
    irb.scsw.dstat = DeviceStatus::CHANNEL_END;
    irb
}

/// Unsolicited attention.
pub fn irb_attention() -> Irb {
    let mut irb = Irb::default();
    irb.scsw.stctl = StatusControl::ALERT | StatusControl::STATUS_PEND;
    irb.scsw.dstat = DeviceStatus::ATTENTION;
    irb
}

/// Halt function completed.
pub fn irb_halted() -> Irb {
    let mut irb = Irb::default();
    irb.scsw.fctl = FunctionControl::HALT;
    irb.scsw.stctl = StatusControl::STATUS_PEND;
    irb
}

pub fn css(fake: &Arc<FakeMachine>) -> ChannelSubsystem {
    css_with(fake, CioConfig::default())
}

pub fn css_with(fake: &Arc<FakeMachine>, config: CioConfig) -> ChannelSubsystem {
    ChannelSubsystem::init(fake.clone(), config)
}

pub fn noop_program() -> ChannelProgram {
    ChannelProgram::single(Ccw::control(CCW_CMD_NOOP, CcwFlags::SLI))
}

pub fn null_handler() -> IoHandler {
    Arc::new(|_: &mut IrqContext<'_>, _: &DevStat| {})
}

/// Records every handler invocation with the usage flags seen at that time.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<(DevStat, UsageFlags)>>>);

impl Recorder {
    pub fn handler(&self) -> IoHandler {
        let calls = self.0.clone();
        Arc::new(move |ctx: &mut IrqContext<'_>, status: &DevStat| {
            calls.lock().push((status.clone(), ctx.flags()));
        })
    }

    pub fn calls(&self) -> Vec<(DevStat, UsageFlags)> {
        self.0.lock().clone()
    }
}
