use crate::error::{Error, Result};
use crate::peer::data_channel::DataChannel;
use crate::stop::StopSignal;
use crate::utils::random_token;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const WARMUP_PAYLOAD: &str = "ping";
const SAMPLE_LEN: usize = 4;

/// Round-trip times measured on the control channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStatistics {
    pub roundtrip_times: Vec<Duration>,
}

impl NetworkStatistics {
    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.roundtrip_times.len()).ok()?;
        if count == 0 {
            return None;
        }
        Some(self.roundtrip_times.iter().sum::<Duration>() / count)
    }

    pub fn min(&self) -> Option<Duration> {
        self.roundtrip_times.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.roundtrip_times.iter().max().copied()
    }
}

async fn expect_echo(channel: &mut DataChannel, expected: &str, stop: &StopSignal) -> Result<()> {
    let reply = tokio::select! {
        reply = channel.recv() => reply,
        code = stop.stopped() => return Err(Error::Stopped(code)),
    };
    match reply {
        Some(data) if data.as_ref() == expected.as_bytes() => Ok(()),
        Some(data) => Err(Error::unexpected(data)),
        None => Err(Error::ChannelClosed("closed during latency probe".to_string())),
    }
}

/// Echo probe: `warmup` discarded pings, then `samples` timed random payloads
pub async fn get_network_statistics(
    channel: &mut DataChannel,
    warmup: usize,
    samples: usize,
    stop: &StopSignal,
) -> Result<NetworkStatistics> {
    for _ in 0..warmup {
        channel.send_text(WARMUP_PAYLOAD).await?;
    }
    for _ in 0..warmup {
        expect_echo(channel, WARMUP_PAYLOAD, stop).await?;
    }

    let mut stats = NetworkStatistics::default();
    for _ in 0..samples {
        let token = random_token(SAMPLE_LEN);
        let started = Instant::now();
        channel.send_text(token.clone()).await?;
        expect_echo(channel, &token, stop).await?;
        stats.roundtrip_times.push(started.elapsed());
    }

    info!(
        "Latency probe on {}: mean={:?} min={:?} max={:?}",
        channel.label(),
        stats.mean(),
        stats.min(),
        stats.max()
    );
    Ok(stats)
}

/// Echo every message back, the node's half of the probe
#[cfg(test)]
pub(crate) async fn echo(channel: &mut DataChannel, count: usize) -> Result<()> {
    for _ in 0..count {
        match channel.recv().await {
            Some(data) => channel.send(data).await?,
            None => return Err(Error::ChannelClosed("closed during echo".to_string())),
        }
    }
    Ok(())
}
