//! # Subsystem Configuration
//!
//! Boot-time tunables for the common I/O layer.

/// Architectural maximum number of subchannels in one subchannel set.
pub const MAX_SUBCHANNELS: u32 = 0x10000;

/// Interruption subclass used for asynchronous device interrupts.
pub const DEFAULT_ISC: u8 = 3;

/// Interruption subclass reserved for synchronous (polled) I/O.
pub const SYNC_ISC: u8 = 5;

/// Interruption subclass of the operator console.
pub const CONSOLE_ISC: u8 = 7;

/// Common I/O configuration.
#[derive(Debug, Clone)]
pub struct CioConfig {
    /// Upper bound for the subchannel scan
    pub max_subchannels: u32,
    /// Interruption subclass assigned to discovered subchannels
    pub default_isc: u8,
    /// Interruption subclass used while polling for synchronous I/O
    pub sync_isc: u8,
    /// Console subclass kept enabled while polling
    pub console_isc: u8,
    /// Try to enable the concurrent sense facility during discovery
    pub concurrent_sense: bool,
    /// Report detected devices at info level
    pub show_messages: bool,
    /// Running as a hypervisor guest (enables the diagnose 210 fallback)
    pub hypervisor_guest: bool,
    /// Modify-subchannel attempts when enabling a subchannel
    pub enable_retries: u32,
    /// Modify-subchannel attempts when disabling a subchannel
    pub disable_retries: u32,
    /// Disable attempts when a handler is removed
    pub free_retries: u32,
    /// SenseID attempts per device
    pub sense_id_retries: u32,
    /// Attempts for read-device-characteristics / read-configuration-data
    pub query_retries: u32,
    /// Modify-subchannel attempts during discovery
    pub msch_retries: u32,
    /// Back-off between busy retries, in microseconds
    pub busy_delay_us: u32,
}

impl Default for CioConfig {
    fn default() -> Self {
        Self {
            max_subchannels: MAX_SUBCHANNELS,
            default_isc: DEFAULT_ISC,
            sync_isc: SYNC_ISC,
            console_isc: CONSOLE_ISC,
            concurrent_sense: true,
            show_messages: false,
            hypervisor_guest: false,
            enable_retries: 3,
            disable_retries: 5,
            free_retries: 3,
            sense_id_retries: 5,
            query_retries: 5,
            msch_retries: 5,
            busy_delay_us: 100,
        }
    }
}

impl CioConfig {
    /// CPU interruption-subclass mask bit for `isc`.
    pub const fn isc_bit(isc: u8) -> u8 {
        0x80 >> (isc & 0x07)
    }

    /// Mask enabled while a synchronous request is being polled.
    pub fn sync_mask(&self) -> u8 {
        Self::isc_bit(self.sync_isc) | Self::isc_bit(self.console_isc)
    }
}
