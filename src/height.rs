//! Block-height-from-timestamp lookups (spec.md §4.1: "a poller resumes from
//! the block around when the flow started, not genesis").
//!
//! Tendermint chains expose a cheap approximation through their indexer
//! (`status` gives the current height/time; a short backscan refines it).
//! EVM chains have no such endpoint, so resolution falls back to a bounded
//! binary search over block headers.

use tokio_util::sync::CancellationToken;

use crate::error::{ErrorSeverity, PollError};
use crate::rpc::evm::EvmClient;
use crate::rpc::tendermint::TendermintClient;
use crate::timestamp::EpochSeconds;

/// How many blocks back from the chain head a single `status` call's average
/// block time is trusted to stay accurate over.
const TENDERMINT_BACKSCAN_WINDOW: u64 = 200;

/// `findTendermintHeightForTimestamp`: approximates the height whose block
/// time is closest to (but not after) `target`, using one `status` call and
/// one `block` call to estimate the chain's average block time, then
/// projecting backward linearly. This is intentionally approximate — pollers
/// scan forward from the estimate, so overshooting backward is safe and
/// undershooting just costs a slightly longer scan.
pub async fn find_tendermint_height_for_timestamp(
    client: &TendermintClient,
    target: EpochSeconds,
    cancel: &CancellationToken,
) -> Result<u64, PollError> {
    let status = client.status(cancel).await?;
    let latest_height: u64 = status
        .sync_info
        .latest_block_height
        .parse()
        .map_err(|_| parse_error("latest_block_height"))?;
    let latest_time = parse_rfc3339_seconds(&status.sync_info.latest_block_time)?;

    if target.0 >= latest_time.0 {
        return Ok(latest_height);
    }

    let reference_height = latest_height.saturating_sub(TENDERMINT_BACKSCAN_WINDOW).max(1);
    let reference_block = client.block(Some(reference_height), cancel).await?;
    let reference_time = parse_rfc3339_seconds(&reference_block.block.header.time)?;

    let height_span = latest_height.saturating_sub(reference_height);
    let time_span = latest_time.0.saturating_sub(reference_time.0).max(1);
    let seconds_per_block = time_span as f64 / height_span.max(1) as f64;

    if target.0 <= reference_time.0 {
        let blocks_before = ((reference_time.0 - target.0) as f64 / seconds_per_block).ceil() as u64;
        return Ok(reference_height.saturating_sub(blocks_before).max(1));
    }

    let blocks_after = ((target.0 - reference_time.0) as f64 / seconds_per_block).floor() as u64;
    Ok(reference_height.saturating_add(blocks_after).min(latest_height))
}

fn parse_error(field: &str) -> PollError {
    PollError::new(ErrorSeverity::PollingError, format!("malformed tendermint field: {field}"))
}

/// Parses a Tendermint RFC3339 timestamp (`2026-08-01T12:34:56.123456789Z`)
/// down to whole seconds, tolerating the variable-precision fractional part
/// Tendermint nodes emit.
fn parse_rfc3339_seconds(s: &str) -> Result<EpochSeconds, PollError> {
    let s = s.strip_suffix('Z').unwrap_or(s);
    let (date, time) = s.split_once('T').ok_or_else(|| parse_error("timestamp"))?;
    let time = time.split('.').next().unwrap_or(time);
    let mut date_parts = date.split('-');
    let year: i64 = date_parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_error("timestamp.year"))?;
    let month: u32 = date_parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_error("timestamp.month"))?;
    let day: u32 = date_parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_error("timestamp.day"))?;
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_error("timestamp.hour"))?;
    let minute: i64 = time_parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_error("timestamp.minute"))?;
    let second: i64 = time_parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| parse_error("timestamp.second"))?;

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + minute * 60 + second;
    Ok(EpochSeconds(secs.max(0) as u64))
}

/// Howard Hinnant's `days_from_civil`, the inverse of the rendering in
/// [`crate::timestamp`], kept local to avoid a cross-module dependency for
/// one small pure function.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = ((m as i64 + 9) % 12) as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// EVM binary search parameters (spec.md §4.1/§4.7).
const EVM_BINARY_SEARCH_MAX_ITERATIONS: u32 = 50;

/// `findEvmBlockForTimestamp`: binary search over `[0, latest]` for the
/// highest block whose timestamp does not exceed `target`, capped at
/// [`EVM_BINARY_SEARCH_MAX_ITERATIONS`] since header fetches are not free and
/// the chain's actual block-time variance means exact convergence isn't
/// guaranteed. On exhaustion, the tightest known lower bound is returned.
pub async fn find_evm_block_for_timestamp(
    client: &EvmClient,
    target: EpochSeconds,
    cancel: &CancellationToken,
) -> Result<u64, PollError> {
    let latest = client.latest_block_number(cancel).await?;
    let latest_block = client
        .block_by_number(latest, cancel)
        .await?
        .ok_or_else(|| PollError::new(ErrorSeverity::PollingError, "latest block not found"))?;
    if latest_block.header.timestamp <= target.0 {
        return Ok(latest);
    }

    let mut low = 0u64;
    let mut high = latest;
    let mut best = 0u64;

    for _ in 0..EVM_BINARY_SEARCH_MAX_ITERATIONS {
        if low > high {
            break;
        }
        let mid = low + (high - low) / 2;
        let block = client
            .block_by_number(mid, cancel)
            .await?
            .ok_or_else(|| PollError::new(ErrorSeverity::PollingError, "block not found during search"))?;
        if block.header.timestamp <= target.0 {
            best = mid;
            if mid == high {
                break;
            }
            low = mid + 1;
        } else {
            if mid == 0 {
                break;
            }
            high = mid - 1;
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_nanosecond_precision() {
        let parsed = parse_rfc3339_seconds("2021-01-01T00:00:00.123456789Z").unwrap();
        assert_eq!(parsed, EpochSeconds(1_609_459_200));
    }

    #[test]
    fn parses_rfc3339_without_fraction() {
        let parsed = parse_rfc3339_seconds("2021-01-01T00:00:00Z").unwrap();
        assert_eq!(parsed, EpochSeconds(1_609_459_200));
    }

    #[test]
    fn days_from_civil_round_trips_with_rendering() {
        // 2024-02-29 is a valid leap day; exercise the era/century arithmetic.
        let parsed = parse_rfc3339_seconds("2024-02-29T12:00:00Z").unwrap();
        let rendered = crate::timestamp::epoch_seconds_to_iso8601(parsed);
        assert_eq!(rendered, "2024-02-29T12:00:00Z");
    }
}
