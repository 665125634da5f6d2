//! # Channel Programs
//!
//! Channel-command words, the channel programs built from them and the
//! operation request block handed to start-subchannel.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

/// BASIC SENSE
pub const CCW_CMD_BASIC_SENSE: u8 = 0x04;
/// SENSE ID
pub const CCW_CMD_SENSE_ID: u8 = 0xE4;
/// READ DEVICE CHARACTERISTICS
pub const CCW_CMD_RDC: u8 = 0x64;
/// READ CONFIGURATION DATA
pub const CCW_CMD_RCD: u8 = 0xFA;
/// NOOP
pub const CCW_CMD_NOOP: u8 = 0x03;

bitflags::bitflags! {
    /// CCW flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CcwFlags: u8 {
        /// Chain data
        const CD = 0x80;
        /// Chain command
        const CC = 0x40;
        /// Suppress length indication
        const SLI = 0x20;
        /// Skip data transfer
        const SKIP = 0x10;
        /// Program-controlled interruption
        const PCI = 0x08;
        /// Indirect data addressing
        const IDA = 0x04;
        /// Suspend
        const SUSPEND = 0x02;
    }
}

bitflags::bitflags! {
    /// Options accepted by `start_io` and `halt_io`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        /// Call the handler at primary status (channel end)
        const RETURN_CHAN_END = 0x01;
        /// The path mask argument is valid
        const VALID_LPM = 0x02;
        /// Poll for the completion before returning
        const WAIT_FOR_INTERRUPT = 0x04;
        /// Call the handler for every interruption
        const REPORT_ALL = 0x08;
        /// Allow the channel program to suspend
        const ALLOW_SUSPEND = 0x10;
        /// Deny prefetching of CCWs
        const DENY_PREFETCH = 0x20;
        /// Suppress the suspended interruption
        const SUPPRESS_INTER = 0x40;
        /// Record the completion without calling the handler
        const DONT_CALL_HANDLER = 0x80;
    }
}

impl IoFlags {
    /// Early notification is another name for returning at channel end.
    pub const EARLY_NOTIFICATION: Self = Self::RETURN_CHAN_END;
}

/// Shared data area referenced by a CCW.
///
/// The channel subsystem transfers data into (or out of) the buffer while the
/// channel program runs; the owner must not rely on its contents until the
/// request has completed.
#[derive(Debug, Clone, Default)]
pub struct DataBuffer(Arc<Mutex<Vec<u8>>>);

impl DataBuffer {
    /// Creates a zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    /// Creates a buffer filled with `byte`.
    pub fn filled(len: usize, byte: u8) -> Self {
        Self(Arc::new(Mutex::new(vec![byte; len])))
    }

    /// Wraps an existing byte vector.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the whole buffer with `byte`.
    pub fn fill(&self, byte: u8) {
        self.0.lock().iter_mut().for_each(|b| *b = byte);
    }

    /// Copies `data` into the buffer starting at `offset`, truncating at the end.
    /// Returns the number of bytes written.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        let mut buf = self.0.lock();
        if offset >= buf.len() {
            return 0;
        }
        let n = data.len().min(buf.len() - offset);
        buf[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    /// Copies out up to `out.len()` bytes. Returns the number copied.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let buf = self.0.lock();
        let n = out.len().min(buf.len());
        out[..n].copy_from_slice(&buf[..n]);
        n
    }

    /// Returns a copy of the first `len` bytes.
    pub fn to_vec(&self, len: usize) -> Vec<u8> {
        let buf = self.0.lock();
        buf[..len.min(buf.len())].to_vec()
    }
}

/// Channel command word.
#[derive(Debug, Clone)]
pub struct Ccw {
    /// Command code
    pub cmd_code: u8,
    pub flags: CcwFlags,
    /// Byte count
    pub count: u16,
    /// Data area
    pub data: Option<DataBuffer>,
}

impl Ccw {
    /// Creates a CCW transferring into/out of `data`.
    pub fn new(cmd_code: u8, flags: CcwFlags, data: DataBuffer) -> Self {
        let count = data.len().min(u16::MAX as usize) as u16;
        Self {
            cmd_code,
            flags,
            count,
            data: Some(data),
        }
    }

    /// Creates a CCW without a data area.
    pub fn control(cmd_code: u8, flags: CcwFlags) -> Self {
        Self {
            cmd_code,
            flags,
            count: 0,
            data: None,
        }
    }
}

/// An immutable channel program.
///
/// Cloning is cheap; the subsystem holds a clone for as long as the program
/// may still be executed by the channel.
#[derive(Debug, Clone)]
pub struct ChannelProgram(Arc<[Ccw]>);

impl ChannelProgram {
    pub fn new(ccws: Vec<Ccw>) -> Self {
        Self(Arc::from(ccws))
    }

    /// A single-CCW program.
    pub fn single(ccw: Ccw) -> Self {
        Self::new(vec![ccw])
    }

    pub fn ccws(&self) -> &[Ccw] {
        &self.0
    }

    /// Address of the first CCW as presented to the channel subsystem.
    pub fn address(&self) -> u32 {
        (self.0.as_ptr() as usize as u32) & 0x7FFF_FFFF
    }
}

bitflags::bitflags! {
    /// ORB control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OrbFlags: u8 {
        /// Suspend control
        const SPND = 0x80;
        /// Streaming mode
        const STR = 0x40;
        /// Modification control
        const MOD = 0x20;
        /// Synchronization control
        const SYNC = 0x10;
        /// Format-1 CCWs
        const FMT = 0x08;
        /// Prefetch allowed
        const PFCH = 0x04;
        /// Suppress suspended-interruption control
        const ISIC = 0x02;
        /// Address-limit checking
        const ALCC = 0x01;
    }
}

/// Operation request block.
#[derive(Debug, Clone)]
pub struct Orb {
    /// Interruption parameter
    pub intparm: u32,
    /// Subchannel key
    pub key: u8,
    pub flags: OrbFlags,
    /// Logical path mask
    pub lpm: u8,
    pub program: ChannelProgram,
}

impl Orb {
    /// Builds the ORB for a start request.
    ///
    /// `opm` is the subchannel's operational path mask, used when the caller
    /// did not supply a valid path mask.
    pub fn build(program: ChannelProgram, intparm: u32, lpm: u8, opm: u8, flags: IoFlags) -> Self {
        let mut orb_flags = OrbFlags::FMT;
        if !flags.contains(IoFlags::DENY_PREFETCH) {
            orb_flags |= OrbFlags::PFCH;
        }
        if flags.contains(IoFlags::ALLOW_SUSPEND) {
            orb_flags |= OrbFlags::SPND;
            if flags.contains(IoFlags::SUPPRESS_INTER) {
                orb_flags |= OrbFlags::ISIC;
            }
        }
        Self {
            intparm,
            key: 0,
            flags: orb_flags,
            lpm: if flags.contains(IoFlags::VALID_LPM) { lpm } else { opm },
            program,
        }
    }

    /// Channel program address for the hardware.
    pub fn cpa(&self) -> u32 {
        self.program.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ChannelProgram {
        ChannelProgram::single(Ccw::control(CCW_CMD_NOOP, CcwFlags::SLI))
    }

    #[test]
    fn test_orb_defaults() {
        let orb = Orb::build(noop(), 0x1234, 0x40, 0xC0, IoFlags::empty());
        assert_eq!(orb.intparm, 0x1234);
        assert_eq!(orb.lpm, 0xC0);
        assert!(orb.flags.contains(OrbFlags::FMT | OrbFlags::PFCH));
        assert!(!orb.flags.contains(OrbFlags::SPND));
    }

    #[test]
    fn test_orb_option_mapping() {
        let flags = IoFlags::VALID_LPM
            | IoFlags::DENY_PREFETCH
            | IoFlags::ALLOW_SUSPEND
            | IoFlags::SUPPRESS_INTER;
        let orb = Orb::build(noop(), 0, 0x40, 0xC0, flags);
        assert_eq!(orb.lpm, 0x40);
        assert!(!orb.flags.contains(OrbFlags::PFCH));
        assert!(orb.flags.contains(OrbFlags::SPND | OrbFlags::ISIC));

        // Suppression only applies to suspendable programs
        let orb = Orb::build(noop(), 0, 0, 0x80, IoFlags::SUPPRESS_INTER);
        assert!(!orb.flags.contains(OrbFlags::ISIC));
    }

    #[test]
    fn test_data_buffer_transfer() {
        let buf = DataBuffer::filled(4, 0xFF);
        assert_eq!(buf.write_at(2, &[1, 2, 3]), 2);
        assert_eq!(buf.to_vec(4), vec![0xFF, 0xFF, 1, 2]);

        let mut out = [0u8; 8];
        assert_eq!(buf.read_into(&mut out), 4);
        assert_eq!(buf.write_at(9, &[0]), 0);
    }

    #[test]
    fn test_ccw_count_follows_buffer() {
        let ccw = Ccw::new(CCW_CMD_RDC, CcwFlags::SLI, DataBuffer::new(64));
        assert_eq!(ccw.count, 64);
        assert_eq!(noop().ccws().len(), 1);
    }
}
