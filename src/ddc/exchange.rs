//! Single-exchange engine: one write / optional read / parse
//! cycle with correctly placed, DSA-scaled sleeps.

use std::time::Duration;

use super::dsa::DsaController;
use super::error::DdcError;
use super::lock::BusId;
use super::packet::{Packet, ParsedResponse};
use super::transport::DdcTransport;

/// Sleep injection point so tests never actually sleep.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeper for production use.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Which sleep is being taken, each with its own base duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEvent {
    PostOpen,
    WriteToRead,
    PostRead,
    PostWrite,
    PostSaveSettings,
    DdcNull,
}

impl SleepEvent {
    /// Base duration before the DSA multiplier is applied.
    pub fn base_ms(self) -> u64 {
        match self {
            SleepEvent::PostOpen => 100,
            SleepEvent::WriteToRead => 40,
            SleepEvent::PostRead => 10,
            SleepEvent::PostWrite => 50,
            SleepEvent::PostSaveSettings => 200,
            SleepEvent::DdcNull => 250,
        }
    }
}

/// Sleep for `event`'s base duration scaled by the bus's current DSA
/// multiplier.
pub fn sleep_for(sleeper: &dyn Sleeper, dsa: &DsaController, bus: BusId, event: SleepEvent) {
    let multiplier = dsa.get_sleep_multiplier(bus);
    let millis = (event.base_ms() as f64 * multiplier).round() as u64;
    sleeper.sleep(Duration::from_millis(millis));
}

/// Whether this exchange expects a read back, and if so which reply opcode.
/// `NonTableVcp` carries the requested VCP code so the parser can reject a
/// stale/cross-talk reply answering a different feature (spec §4.1 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedReply {
    None,
    NonTableVcp(u8),
    TableRead,
    Capabilities,
}

const OP_VCP_REPLY: u8 = 0x02;
const OP_TABLE_READ_REPLY: u8 = 0xe4;
const OP_CAPABILITIES_REPLY: u8 = 0xe3;

/// Perform one write / optional read / parse cycle against `transport`.
///
/// `is_write_only` selects the `POST_WRITE`/`PostSaveSettings` sleep
/// placements for a fire-and-forget write instead of `WRITE_TO_READ`.
pub fn single_exchange(
    transport: &mut dyn DdcTransport,
    sleeper: &dyn Sleeper,
    dsa: &DsaController,
    bus: BusId,
    bytewise: bool,
    max_read_len: usize,
    request: &Packet,
    expected: ExpectedReply,
    post_write_event: SleepEvent,
) -> Result<Option<Packet>, DdcError> {
    // The destination byte (`bytes[0]`, `0x6e`) is implicit on the wire —
    // real hardware never sees it.
    transport.write(&request.bytes()[1..])?;

    if expected == ExpectedReply::None {
        sleep_for(sleeper, dsa, bus, post_write_event);
        return Ok(None);
    }

    sleep_for(sleeper, dsa, bus, SleepEvent::WriteToRead);

    let read_result = transport.read(bytewise, max_read_len);
    sleep_for(sleeper, dsa, bus, SleepEvent::PostRead);
    let raw = read_result?;

    if raw.iter().all(|&b| b == 0) {
        return Err(DdcError::AllZero);
    }

    let (expected_opcode, requested_vcp_code) = match expected {
        ExpectedReply::NonTableVcp(code) => (OP_VCP_REPLY, Some(code)),
        ExpectedReply::TableRead => (OP_TABLE_READ_REPLY, None),
        ExpectedReply::Capabilities => (OP_CAPABILITIES_REPLY, None),
        ExpectedReply::None => unreachable!(),
    };

    let parsed = Packet::parse_response(&raw, expected_opcode, requested_vcp_code)?;
    if parsed.parsed() == Some(&ParsedResponse::Null) {
        return Err(DdcError::NullResponse);
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddc::dsa::{Clock, SystemClock};
    use crate::ddc::transport::ScriptedTransport;
    use std::cell::RefCell;

    struct NoopSleeper {
        calls: RefCell<Vec<Duration>>,
    }
    impl Sleeper for NoopSleeper {
        fn sleep(&self, duration: Duration) {
            self.calls.borrow_mut().push(duration);
        }
    }

    fn dsa() -> DsaController {
        DsaController::new(Box::new(SystemClock) as Box<dyn Clock>)
    }

    #[test]
    fn all_zero_read_is_classified() {
        let mut transport = ScriptedTransport::new(vec![Ok(vec![0u8; 11])]);
        let sleeper = NoopSleeper { calls: RefCell::new(Vec::new()) };
        let d = dsa();
        let req = Packet::get_vcp_request(0x10);
        let result = single_exchange(
            &mut transport,
            &sleeper,
            &d,
            BusId(1),
            false,
            11,
            &req,
            ExpectedReply::NonTableVcp(0x10),
            SleepEvent::PostWrite,
        );
        assert_eq!(result.unwrap_err(), DdcError::AllZero);
    }

    #[test]
    fn null_response_is_classified() {
        use crate::ddc::packet::NULL_RESPONSE_WIRE;
        let mut transport = ScriptedTransport::new(vec![Ok(NULL_RESPONSE_WIRE.to_vec())]);
        let sleeper = NoopSleeper { calls: RefCell::new(Vec::new()) };
        let d = dsa();
        let req = Packet::get_vcp_request(0xdf);
        let result = single_exchange(
            &mut transport,
            &sleeper,
            &d,
            BusId(1),
            false,
            NULL_RESPONSE_WIRE.len(),
            &req,
            ExpectedReply::NonTableVcp(0xdf),
            SleepEvent::PostWrite,
        );
        assert_eq!(result.unwrap_err(), DdcError::NullResponse);
    }

    #[test]
    fn write_only_exchange_sleeps_post_write_not_write_to_read() {
        let mut transport = ScriptedTransport::new(vec![]);
        let sleeper = NoopSleeper { calls: RefCell::new(Vec::new()) };
        let d = dsa();
        let req = Packet::set_vcp_request(0x10, 50);
        let result = single_exchange(
            &mut transport,
            &sleeper,
            &d,
            BusId(1),
            false,
            0,
            &req,
            ExpectedReply::None,
            SleepEvent::PostWrite,
        );
        assert!(result.unwrap().is_none());
        assert_eq!(sleeper.calls.borrow().len(), 1);
    }
}
