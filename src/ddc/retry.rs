//! Retry controller: bounded retry with classification of
//! transient vs fatal failures, driving the single-exchange engine.

use std::sync::Mutex;

use super::dsa::DsaController;
use super::error::{DdcError, ErrorChain};
use super::exchange::{single_exchange, ExpectedReply, Sleeper, SleepEvent};
use super::lock::BusId;
use super::packet::Packet;
use super::transport::DdcTransport;

/// Per-operation-kind retry statistics.
///
/// `counters[0]` is fatal failures, `counters[1]` is exhausted-retry
/// failures, and `counters[k+1]` for `k >= 1` is "succeeded after k tries".
pub struct RetryStats {
    stat_name: &'static str,
    max_tries: u8,
    counters: Mutex<Vec<u64>>,
}

impl RetryStats {
    pub fn new(stat_name: &'static str, max_tries: u8) -> Self {
        RetryStats {
            stat_name,
            max_tries,
            counters: Mutex::new(vec![0; max_tries as usize + 2]),
        }
    }

    pub fn reset(&self) {
        let mut c = self.counters.lock().unwrap();
        for slot in c.iter_mut() {
            *slot = 0;
        }
    }

    pub fn record_fatal(&self) {
        self.counters.lock().unwrap()[0] += 1;
    }

    pub fn record_exhausted(&self) {
        self.counters.lock().unwrap()[1] += 1;
    }

    /// `tries` is 1-based: the operation succeeded on its `tries`-th attempt.
    pub fn record_success_after(&self, tries: u8) {
        let idx = (tries as usize + 1).min(self.counters.lock().unwrap().len() - 1);
        self.counters.lock().unwrap()[idx] += 1;
    }

    /// Human-readable report row, grouped by operation kind.
    pub fn format_report(&self) -> String {
        let c = self.counters.lock().unwrap();
        let mut out = format!(
            "{:<20} fatal={:<6} exhausted={:<6}",
            self.stat_name, c[0], c[1]
        );
        for k in 1..=self.max_tries {
            out.push_str(&format!(" after{}={}", k, c[k as usize + 1]));
        }
        out
    }
}

/// Tunable policy for a `write_read_with_retry` call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_tries: u8,
    pub monitor_uses_null_for_unsupported: bool,
    pub all_zero_response_ok: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_tries: 4,
            monitor_uses_null_for_unsupported: false,
            all_zero_response_ok: false,
        }
    }
}

/// Drive a single bus transaction to completion over `single_exchange`,
/// bounded-retrying transient failures and feeding DSA.
#[allow(clippy::too_many_arguments)]
pub fn write_read_with_retry(
    transport: &mut dyn DdcTransport,
    sleeper: &dyn Sleeper,
    dsa: &DsaController,
    stats: &RetryStats,
    bus: BusId,
    bytewise: bool,
    max_read_len: usize,
    request: &Packet,
    expected: ExpectedReply,
) -> Result<Packet, ErrorChain>
where
{
    write_read_with_retry_policy(
        transport,
        sleeper,
        dsa,
        stats,
        bus,
        bytewise,
        max_read_len,
        request,
        expected,
        &RetryPolicy::default(),
    )
}

/// Same as [`write_read_with_retry`] but with an explicit policy.
#[allow(clippy::too_many_arguments)]
pub fn write_read_with_retry_policy(
    transport: &mut dyn DdcTransport,
    sleeper: &dyn Sleeper,
    dsa: &DsaController,
    stats: &RetryStats,
    bus: BusId,
    bytewise: bool,
    max_read_len: usize,
    request: &Packet,
    expected: ExpectedReply,
    policy: &RetryPolicy,
) -> Result<Packet, ErrorChain> {
    let null_max: u32 = if policy.monitor_uses_null_for_unsupported { 0 } else { 3 };
    let mut null_seen: u32 = 0;
    let mut zero_seen: u32 = 0;
    let mut tries: u8 = 0;
    let mut causes = Vec::new();
    let mut retryable = true;
    let mut last_err: Option<DdcError> = None;

    while tries < policy.max_tries && retryable {
        let result = single_exchange(
            transport,
            sleeper,
            dsa,
            bus,
            bytewise,
            max_read_len,
            request,
            expected,
            SleepEvent::PostWrite,
        );
        tries += 1;

        match result {
            Ok(Some(pkt)) => {
                dsa.record_final(bus, super::dsa::OperationOutcome::Success, tries);
                stats.record_success_after(tries);
                return Ok(pkt);
            }
            Ok(None) => unreachable!("write_read_with_retry always expects a reply"),
            Err(err) => {
                causes.push(err);
                last_err = Some(err);
                let tries_remaining = (policy.max_tries - tries).max(1) as u32;

                match err {
                    DdcError::NullResponse => {
                        null_seen += 1;
                        // Bumped unconditionally, not only while retryable,
                        // so the step keeps climbing on the loop's last
                        // attempt too — see DESIGN.md.
                        dsa.set_retry_loop_step(bus, (null_seen + 1) as usize);
                        retryable = null_seen < null_max;
                    }
                    DdcError::AllZero => {
                        zero_seen += 1;
                        retryable = !policy.all_zero_response_ok;
                        if retryable {
                            dsa.note_retryable_failure(bus, tries_remaining);
                        }
                    }
                    DdcError::Io(errno) if err.is_fatal() => {
                        retryable = false;
                        let _ = errno;
                    }
                    DdcError::Io(_) => {
                        // -EIO / -ENXIO: historically retryable.
                        retryable = true;
                        dsa.note_retryable_failure(bus, tries_remaining);
                    }
                    DdcError::MalformedData(_) => {
                        retryable = true;
                        dsa.note_retryable_failure(bus, tries_remaining);
                    }
                    _ => {
                        retryable = false;
                    }
                }
            }
        }
    }

    dsa.record_final(bus, super::dsa::OperationOutcome::Failure, tries);

    log::debug!(
        "{} on bus {:?} failed after {} tries (null_seen={}, zero_seen={})",
        stats.stat_name,
        bus,
        tries,
        null_seen,
        zero_seen
    );

    let last_err = last_err.unwrap_or(DdcError::RetriesExhausted);
    let classified = match last_err {
        DdcError::NullResponse if null_seen >= null_max => DdcError::AllResponsesNull,
        DdcError::AllZero => DdcError::AllTriesZero,
        other if other.is_fatal() => other,
        _ => DdcError::RetriesExhausted,
    };
    if classified.is_fatal() {
        log::warn!("{} on bus {:?} hit a fatal error: {}", stats.stat_name, bus, classified);
        stats.record_fatal();
    } else {
        stats.record_exhausted();
    }

    Err(ErrorChain::new(classified, "write_read_with_retry", causes))
}

/// Write-only variant (e.g. Set VCP): only `-EIO` is retryable, no response
/// to classify.
pub fn write_only_with_retry(
    transport: &mut dyn DdcTransport,
    sleeper: &dyn Sleeper,
    dsa: &DsaController,
    stats: &RetryStats,
    bus: BusId,
    max_tries: u8,
    request: &Packet,
    post_event: SleepEvent,
) -> Result<(), ErrorChain> {
    let mut tries: u8 = 0;
    let mut causes = Vec::new();
    let mut retryable = true;

    while tries < max_tries && retryable {
        let result = single_exchange(
            transport,
            sleeper,
            dsa,
            bus,
            false,
            0,
            request,
            ExpectedReply::None,
            post_event,
        );
        tries += 1;
        match result {
            Ok(_) => {
                dsa.record_final(bus, super::dsa::OperationOutcome::Success, tries);
                stats.record_success_after(tries);
                return Ok(());
            }
            Err(DdcError::Io(errno)) if errno != super::error::EBADF => {
                causes.push(DdcError::Io(errno));
                retryable = true;
                let tries_remaining = (max_tries - tries).max(1) as u32;
                dsa.note_retryable_failure(bus, tries_remaining);
            }
            Err(other) => {
                causes.push(other);
                retryable = false;
            }
        }
    }

    dsa.record_final(bus, super::dsa::OperationOutcome::Failure, tries);
    let classified = causes.last().copied().unwrap_or(DdcError::RetriesExhausted);
    if classified.is_fatal() {
        stats.record_fatal();
    } else {
        stats.record_exhausted();
    }
    Err(ErrorChain::new(
        if classified.is_fatal() { classified } else { DdcError::RetriesExhausted },
        "write_only_with_retry",
        causes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddc::dsa::{Clock, SystemClock};
    use crate::ddc::packet::NULL_RESPONSE_WIRE;
    use crate::ddc::transport::ScriptedTransport;

    struct NoopSleeper;
    impl Sleeper for NoopSleeper {
        fn sleep(&self, _duration: std::time::Duration) {}
    }

    fn dsa() -> DsaController {
        DsaController::new(Box::new(SystemClock) as Box<dyn Clock>)
    }

    #[test]
    fn s2_all_null_responses_classified_all_responses_null() {
        let mut transport = ScriptedTransport::new(vec![
            Ok(NULL_RESPONSE_WIRE.to_vec()),
            Ok(NULL_RESPONSE_WIRE.to_vec()),
            Ok(NULL_RESPONSE_WIRE.to_vec()),
        ]);
        let sleeper = NoopSleeper;
        let d = dsa();
        let stats = RetryStats::new("write-read", 10);
        let req = Packet::get_vcp_request(0xdf);
        let policy = RetryPolicy {
            max_tries: 10,
            monitor_uses_null_for_unsupported: false,
            all_zero_response_ok: false,
        };
        let result = write_read_with_retry_policy(
            &mut transport,
            &sleeper,
            &d,
            &stats,
            BusId(1),
            false,
            NULL_RESPONSE_WIRE.len(),
            &req,
            ExpectedReply::NonTableVcp(0xdf),
            &policy,
        );
        let chain = result.unwrap_err();
        assert_eq!(chain.error, DdcError::AllResponsesNull);
        assert_eq!(chain.causes.len(), 3);
        assert!(chain.causes.iter().all(|c| *c == DdcError::NullResponse));
        // record_final(Failure) resets retry_loop_step to the global default
        // once the loop as a whole gives up; the step-4 multiplier this scenario builds up is only in
        // effect for the sleep taken before the loop's own last attempt.
        assert_eq!(
            d.get_sleep_multiplier(BusId(1)),
            crate::ddc::dsa::STEPS[crate::ddc::dsa::INITIAL_STEP] as f64 / 100.0
        );
    }

    #[test]
    fn s3_all_zero_ok_terminates_after_one_attempt() {
        let mut transport = ScriptedTransport::new(vec![Ok(vec![0u8; 11])]);
        let sleeper = NoopSleeper;
        let d = dsa();
        let stats = RetryStats::new("table-read", 4);
        let req = Packet::table_read_request(0x73, 0);
        let policy = RetryPolicy {
            max_tries: 4,
            monitor_uses_null_for_unsupported: false,
            all_zero_response_ok: true,
        };
        let result = write_read_with_retry_policy(
            &mut transport,
            &sleeper,
            &d,
            &stats,
            BusId(1),
            false,
            11,
            &req,
            ExpectedReply::TableRead,
            &policy,
        );
        let chain = result.unwrap_err();
        assert_eq!(chain.error, DdcError::AllTriesZero);
        assert_eq!(chain.causes.len(), 1);
    }

    #[test]
    fn ebadf_aborts_immediately_without_further_attempts() {
        let mut transport =
            ScriptedTransport::new(vec![Err(DdcError::Io(crate::ddc::error::EBADF))]);
        let sleeper = NoopSleeper;
        let d = dsa();
        let stats = RetryStats::new("write-read", 4);
        let req = Packet::get_vcp_request(0x10);
        let result = write_read_with_retry(
            &mut transport,
            &sleeper,
            &d,
            &stats,
            BusId(1),
            false,
            11,
            &req,
            ExpectedReply::NonTableVcp(0x10),
        );
        let chain = result.unwrap_err();
        assert_eq!(chain.causes.len(), 1);
        assert_eq!(chain.error, DdcError::Io(crate::ddc::error::EBADF));
    }

    #[test]
    fn success_after_retries_records_stat() {
        let mut transport = ScriptedTransport::new(vec![
            Err(DdcError::Io(5)),
            Ok({
                let mut reply = vec![0x6e, 0x88, 0x02, 0x00, 0x10, 0x00, 0x00, 0x64, 0x00, 0x32, 0xf2];
                reply.truncate(11);
                reply
            }),
        ]);
        let sleeper = NoopSleeper;
        let d = dsa();
        let stats = RetryStats::new("write-read", 4);
        let req = Packet::get_vcp_request(0x10);
        let result = write_read_with_retry(
            &mut transport,
            &sleeper,
            &d,
            &stats,
            BusId(1),
            false,
            11,
            &req,
            ExpectedReply::NonTableVcp(0x10),
        );
        assert!(result.is_ok());
    }
}
