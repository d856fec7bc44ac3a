//! Multi-part transfer: offset-driven fragment reassembly
//! used by Capabilities and Table Read.

use super::dsa::DsaController;
use super::error::{DdcError, ErrorChain};
use super::exchange::{ExpectedReply, Sleeper};
use super::lock::BusId;
use super::packet::{MultiPartKind, Packet, ParsedResponse};
use super::retry::{write_read_with_retry, RetryStats};
use super::transport::DdcTransport;

/// Default cap on a capabilities string, comfortably above what any real
/// monitor reports.
pub const DEFAULT_CAPABILITIES_CAP: usize = 16 * 1024;

/// Cap on a reassembled table-read value.
pub const DEFAULT_TABLE_CAP: usize = 16 * 1024;

const MULTI_PART_MAX_RETRIES: u32 = 8;

/// Read and reassemble a device's MCCS capabilities string.
///
/// Trims trailing spaces/NULs and appends a single NUL terminator.
pub fn read_capabilities(
    transport: &mut dyn DdcTransport,
    sleeper: &dyn Sleeper,
    dsa: &DsaController,
    stats: &RetryStats,
    bus: BusId,
    max_read_len: usize,
    cap: usize,
) -> Result<Vec<u8>, ErrorChain> {
    let mut buf = read_fragments(
        transport,
        sleeper,
        dsa,
        stats,
        bus,
        max_read_len,
        cap,
        MultiPartKind::Capabilities,
        |offset| Packet::capabilities_request(offset as u32),
    )?;

    while matches!(buf.last(), Some(b' ') | Some(0)) {
        buf.pop();
    }
    buf.push(0);
    Ok(buf)
}

/// Read and reassemble a table-valued VCP feature.
pub fn read_table(
    transport: &mut dyn DdcTransport,
    sleeper: &dyn Sleeper,
    dsa: &DsaController,
    stats: &RetryStats,
    bus: BusId,
    max_read_len: usize,
    cap: usize,
    vcp_code: u8,
) -> Result<Vec<u8>, ErrorChain> {
    read_fragments(
        transport,
        sleeper,
        dsa,
        stats,
        bus,
        max_read_len,
        cap,
        MultiPartKind::TableRead,
        move |offset| Packet::table_read_request(vcp_code, offset as u32),
    )
}

#[allow(clippy::too_many_arguments)]
fn read_fragments(
    transport: &mut dyn DdcTransport,
    sleeper: &dyn Sleeper,
    dsa: &DsaController,
    stats: &RetryStats,
    bus: BusId,
    max_read_len: usize,
    cap: usize,
    kind: MultiPartKind,
    build_request: impl Fn(u16) -> Packet,
) -> Result<Vec<u8>, ErrorChain> {
    let expected = match kind {
        MultiPartKind::Capabilities => ExpectedReply::Capabilities,
        MultiPartKind::TableRead => ExpectedReply::TableRead,
    };

    let mut buffer = Vec::new();
    let mut offset: u16 = 0;
    let mut mismatch_retries = 0u32;

    loop {
        let mut request = build_request(offset);
        if offset != 0 {
            request.update_offset(offset);
        }

        let reply = write_read_with_retry(
            transport,
            sleeper,
            dsa,
            stats,
            bus,
            false,
            max_read_len,
            &request,
            expected,
        )?;

        let fragment = match reply.parsed() {
            Some(ParsedResponse::MultiPart(frag)) if frag.fragment_kind == kind => frag,
            _ => {
                return Err(ErrorChain::leaf(
                    DdcError::MalformedData("unexpected reply to multi-part request"),
                    "multipart",
                ))
            }
        };

        if fragment.offset != offset {
            mismatch_retries += 1;
            if mismatch_retries > MULTI_PART_MAX_RETRIES {
                return Err(ErrorChain::leaf(
                    DdcError::MalformedData("multi-part offset mismatch exceeded retry budget"),
                    "multipart",
                ));
            }
            continue;
        }

        if fragment.payload.is_empty() {
            break;
        }

        if buffer.len() + fragment.payload.len() > cap {
            return Err(ErrorChain::leaf(
                DdcError::MalformedData("multi-part transfer exceeded size cap"),
                "multipart",
            ));
        }

        buffer.extend_from_slice(&fragment.payload);
        offset = offset
            .checked_add(fragment.payload.len() as u16)
            .ok_or_else(|| {
                ErrorChain::leaf(DdcError::MalformedData("multi-part offset overflow"), "multipart")
            })?;
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddc::dsa::{Clock, DsaController, SystemClock};
    use crate::ddc::exchange::Sleeper;
    use crate::ddc::packet::{MAX_FRAGMENT_LEN};
    use crate::ddc::transport::ScriptedTransport;

    struct NoopSleeper;
    impl Sleeper for NoopSleeper {
        fn sleep(&self, _duration: std::time::Duration) {}
    }

    fn dsa() -> DsaController {
        DsaController::new(Box::new(SystemClock) as Box<dyn Clock>)
    }

    fn synth_capabilities_fragment(offset: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0xe3u8, (offset >> 8) as u8, (offset & 0xff) as u8];
        data.extend_from_slice(payload);
        let mut wire = vec![0x6e, 0x80 | data.len() as u8];
        wire.extend_from_slice(&data);
        let mut synth = vec![0x6f, 0x6e, 0x80 | data.len() as u8];
        synth.extend_from_slice(&data);
        let mut checksum = 0x50u8;
        for &b in &synth[1..] {
            checksum ^= b;
        }
        wire.push(checksum);
        wire
    }

    #[test]
    fn s6_capabilities_reassembly() {
        let frag1 = synth_capabilities_fragment(0, &[b'A'; MAX_FRAGMENT_LEN]);
        let frag2 = synth_capabilities_fragment(32, b"helloworld"); // 10 bytes
        let frag3 = synth_capabilities_fragment(42, &[]);

        let max_len = frag1.len().max(frag2.len()).max(frag3.len());
        let mut transport =
            ScriptedTransport::new(vec![Ok(frag1), Ok(frag2), Ok(frag3)]);
        let sleeper = NoopSleeper;
        let d = dsa();
        let stats = RetryStats::new("capabilities", 4);

        let result = read_capabilities(
            &mut transport,
            &sleeper,
            &d,
            &stats,
            BusId(1),
            max_len,
            DEFAULT_CAPABILITIES_CAP,
        )
        .unwrap();

        // 32 'A's + "helloworld" (10) = 42 bytes, plus the trailing NUL
        // terminator (no trailing spaces here to trim).
        assert_eq!(result.len(), 43);
        assert_eq!(*result.last().unwrap(), 0);
        assert!(result[..42].iter().all(|&b| b != 0));
    }

    #[test]
    fn trims_trailing_spaces_before_nul() {
        let frag1 = synth_capabilities_fragment(0, b"abc   ");
        let frag2 = synth_capabilities_fragment(6, &[]);
        let max_len = frag1.len().max(frag2.len());
        let mut transport = ScriptedTransport::new(vec![Ok(frag1), Ok(frag2)]);
        let sleeper = NoopSleeper;
        let d = dsa();
        let stats = RetryStats::new("capabilities", 4);

        let result = read_capabilities(
            &mut transport,
            &sleeper,
            &d,
            &stats,
            BusId(1),
            max_len,
            DEFAULT_CAPABILITIES_CAP,
        )
        .unwrap();
        assert_eq!(result, b"abc\0");
    }
}
