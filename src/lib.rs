//! DDC/CI core I/O engine.
//!
//! This crate owns the protocol-level plumbing for talking to a VESA
//! DDC/CI monitor over I2C: packet framing and parsing, the single-exchange
//! write/read cycle, a bounded retry controller with failure classification,
//! multi-part reassembly for capabilities/table reads, and a per-bus Dynamic
//! Sleep Adjustment controller that learns how long a given monitor needs
//! between a write and its reply. Feature-code metadata, EDID parsing,
//! display enumeration and any CLI surface are deliberately left to callers
//! that build on top of [`ddc::transport::DdcTransport`] and [`Engine`].

pub mod ddc;

use ddc::dsa::{Clock, DsaController, SystemClock};
use ddc::error::ErrorChain;
use ddc::exchange::Sleeper;
use ddc::lock::{BusId, DisplayGuard, DisplayLock};
use ddc::multipart::{self, DEFAULT_CAPABILITIES_CAP, DEFAULT_TABLE_CAP};
use ddc::packet::{NonTableVcpResponse, Packet, ParsedResponse};
use ddc::retry::{write_only_with_retry, write_read_with_retry_policy, RetryPolicy, RetryStats};
use ddc::transport::DdcTransport;

/// Every numeric knob the engine needs, gathered in one place instead of
/// scattered across `exchange.rs`/`retry.rs`/`dsa.rs` as magic numbers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub get_vcp_max_tries: u8,
    pub set_vcp_max_tries: u8,
    pub save_settings_max_tries: u8,
    pub capabilities_max_tries: u8,
    pub table_read_max_tries: u8,
    pub table_write_max_tries: u8,
    pub monitor_uses_null_for_unsupported: bool,
    pub all_zero_response_ok: bool,
    pub bytewise_reads: bool,
    pub max_read_len: usize,
    pub max_transfer_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            get_vcp_max_tries: 4,
            set_vcp_max_tries: 4,
            save_settings_max_tries: 2,
            capabilities_max_tries: 4,
            table_read_max_tries: 4,
            table_write_max_tries: 4,
            monitor_uses_null_for_unsupported: false,
            all_zero_response_ok: false,
            bytewise_reads: false,
            max_read_len: 40,
            max_transfer_len: DEFAULT_TABLE_CAP,
        }
    }
}

struct OperationStats {
    get_vcp: RetryStats,
    set_vcp: RetryStats,
    save_settings: RetryStats,
    capabilities: RetryStats,
    table_read: RetryStats,
    table_write: RetryStats,
}

impl OperationStats {
    fn new(config: &EngineConfig) -> Self {
        OperationStats {
            get_vcp: RetryStats::new("get-vcp", config.get_vcp_max_tries),
            set_vcp: RetryStats::new("set-vcp", config.set_vcp_max_tries),
            save_settings: RetryStats::new("save-settings", config.save_settings_max_tries),
            capabilities: RetryStats::new("capabilities", config.capabilities_max_tries),
            table_read: RetryStats::new("table-read", config.table_read_max_tries),
            table_write: RetryStats::new("table-write", config.table_write_max_tries),
        }
    }
}

/// Top-level handle tying the open-display lock, the per-bus DSA
/// controller, and the per-operation retry statistics together.
///
/// An `Engine` is process-wide state; callers open a bus to get a
/// [`DisplayGuard`] and then drive it with a transport and sleeper of their
/// choosing (production: [`ddc::transport::LinuxTransport`] and
/// `ddc::exchange::ThreadSleeper`; tests: fakes).
pub struct Engine {
    config: EngineConfig,
    lock: DisplayLock,
    dsa: DsaController,
    stats: OperationStats,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Box<dyn Clock>) -> Self {
        Engine {
            stats: OperationStats::new(&config),
            config,
            lock: DisplayLock::new(),
            dsa: DsaController::new(clock),
        }
    }

    /// Acquire the process-wide open-display lock for `bus`.
    ///
    /// Takes the `POST_OPEN` sleep before returning, so the first exchange
    /// a caller performs on the freshly opened handle is already correctly
    /// spaced from the open per `spec.md` §4.3.
    pub fn open(
        &self,
        sleeper: &dyn Sleeper,
        bus: BusId,
        wait: bool,
    ) -> Result<DisplayGuard<'_>, ddc::error::DdcError> {
        let guard = self.lock.open(bus, wait)?;
        ddc::exchange::sleep_for(sleeper, &self.dsa, bus, ddc::exchange::SleepEvent::PostOpen);
        Ok(guard)
    }

    /// Every operation below drives the device through an already-open
    /// [`DisplayGuard`] rather than a bare [`BusId`]: the guard is the only
    /// way to prove this thread holds the bus's exclusive open-display lock
    /// (spec §5), and a guard whose handle has gone stale — closed out from
    /// under a caller holding a copy — is rejected with
    /// [`ddc::error::DdcError::InvalidOperation`] (spec §7) instead of
    /// silently driving the transaction.
    fn require_open(&self, guard: &DisplayGuard<'_>) -> Result<(), ErrorChain> {
        if !guard.is_valid() {
            return Err(ErrorChain::leaf(ddc::error::DdcError::InvalidOperation, "engine"));
        }
        Ok(())
    }

    /// `GetVcp(code)`.
    pub fn get_vcp(
        &self,
        transport: &mut dyn DdcTransport,
        sleeper: &dyn Sleeper,
        guard: &DisplayGuard<'_>,
        code: u8,
    ) -> Result<NonTableVcpResponse, ErrorChain> {
        self.require_open(guard)?;
        let request = Packet::get_vcp_request(code);
        let policy = RetryPolicy {
            max_tries: self.config.get_vcp_max_tries,
            monitor_uses_null_for_unsupported: self.config.monitor_uses_null_for_unsupported,
            all_zero_response_ok: self.config.all_zero_response_ok,
        };
        let reply = write_read_with_retry_policy(
            transport,
            sleeper,
            &self.dsa,
            &self.stats.get_vcp,
            guard.bus(),
            self.config.bytewise_reads,
            self.config.max_read_len,
            &request,
            ddc::exchange::ExpectedReply::NonTableVcp(code),
            &policy,
        )?;
        match reply.parsed() {
            Some(ParsedResponse::NonTableVcp(v)) => Ok(*v),
            _ => Err(ErrorChain::leaf(ddc::error::DdcError::MalformedData("expected non-table VCP reply"), "get_vcp")),
        }
    }

    /// `SetVcp(code, value)`.
    pub fn set_vcp(
        &self,
        transport: &mut dyn DdcTransport,
        sleeper: &dyn Sleeper,
        guard: &DisplayGuard<'_>,
        code: u8,
        value: u16,
    ) -> Result<(), ErrorChain> {
        self.require_open(guard)?;
        let request = Packet::set_vcp_request(code, value);
        write_only_with_retry(
            transport,
            sleeper,
            &self.dsa,
            &self.stats.set_vcp,
            guard.bus(),
            self.config.set_vcp_max_tries,
            &request,
            ddc::exchange::SleepEvent::PostWrite,
        )
    }

    /// `SaveSettings`.
    pub fn save_settings(
        &self,
        transport: &mut dyn DdcTransport,
        sleeper: &dyn Sleeper,
        guard: &DisplayGuard<'_>,
    ) -> Result<(), ErrorChain> {
        self.require_open(guard)?;
        let request = Packet::save_settings_request();
        write_only_with_retry(
            transport,
            sleeper,
            &self.dsa,
            &self.stats.save_settings,
            guard.bus(),
            self.config.save_settings_max_tries,
            &request,
            ddc::exchange::SleepEvent::PostSaveSettings,
        )
    }

    /// Read and reassemble the monitor's MCCS capabilities string.
    pub fn read_capabilities(
        &self,
        transport: &mut dyn DdcTransport,
        sleeper: &dyn Sleeper,
        guard: &DisplayGuard<'_>,
    ) -> Result<Vec<u8>, ErrorChain> {
        self.require_open(guard)?;
        multipart::read_capabilities(
            transport,
            sleeper,
            &self.dsa,
            &self.stats.capabilities,
            guard.bus(),
            self.config.max_read_len,
            self.config.max_transfer_len.min(DEFAULT_CAPABILITIES_CAP),
        )
    }

    /// Read and reassemble a table-valued VCP feature.
    pub fn read_table(
        &self,
        transport: &mut dyn DdcTransport,
        sleeper: &dyn Sleeper,
        guard: &DisplayGuard<'_>,
        code: u8,
    ) -> Result<Vec<u8>, ErrorChain> {
        self.require_open(guard)?;
        multipart::read_table(
            transport,
            sleeper,
            &self.dsa,
            &self.stats.table_read,
            guard.bus(),
            self.config.max_read_len,
            self.config.max_transfer_len,
            code,
        )
    }

    /// Write one fragment (`payload.len() <= 31`) of a table-valued VCP
    /// feature at `offset`.
    pub fn write_table(
        &self,
        transport: &mut dyn DdcTransport,
        sleeper: &dyn Sleeper,
        guard: &DisplayGuard<'_>,
        code: u8,
        offset: u32,
        payload: &[u8],
    ) -> Result<(), ErrorChain> {
        self.require_open(guard)?;
        let request = Packet::table_write_request(code, offset, payload)
            .map_err(|e| ErrorChain::leaf(e, "write_table"))?;
        write_only_with_retry(
            transport,
            sleeper,
            &self.dsa,
            &self.stats.table_write,
            guard.bus(),
            self.config.table_write_max_tries,
            &request,
            ddc::exchange::SleepEvent::PostWrite,
        )
    }

    /// Human-readable retry-statistics report, one row per operation kind.
    pub fn retry_report(&self) -> String {
        [
            self.stats.get_vcp.format_report(),
            self.stats.set_vcp.format_report(),
            self.stats.save_settings.format_report(),
            self.stats.capabilities.format_report(),
            self.stats.table_read.format_report(),
            self.stats.table_write.format_report(),
        ]
        .join("\n")
    }

    /// Persist DSA state for every bus seen so far.
    pub fn save_dsa_state<W: std::io::Write>(&self, out: W) -> std::io::Result<()> {
        self.dsa.save_to(out)
    }

    /// Restore DSA state from a previously saved blob.
    pub fn load_dsa_state<R: std::io::Read>(&self, input: R) -> std::io::Result<()> {
        self.dsa.load_from(input)
    }
}
