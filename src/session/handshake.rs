use crate::error::{Error, Result};
use crate::peer::data_channel::DataChannel;
use crate::session::frames::wait_for_command_request;
use crate::session::launch::LaunchPlan;
use crate::session::probe::{get_network_statistics, NetworkStatistics};
use crate::stop::StopSignal;
use tracing::info;

fn ensure_active(stop: &StopSignal) -> Result<()> {
    match stop.code() {
        Some(code) => Err(Error::Stopped(code)),
        None => Ok(()),
    }
}

/// The fixed exchange that turns an open control channel into a live session
pub struct ControlHandshake<'a> {
    pub plan: &'a LaunchPlan,
    pub probe_warmup: usize,
    pub probe_samples: usize,
}

impl ControlHandshake<'_> {
    /// Run all steps in order. `eliminate` is called once, after the second
    /// sentinel and before anything is launched; its error aborts the handshake.
    pub async fn run<F>(
        &self,
        channel: &mut DataChannel,
        stop: &StopSignal,
        eliminate: F,
    ) -> Result<NetworkStatistics>
    where
        F: FnOnce() -> Result<()> + Send,
    {
        wait_for_command_request(channel, stop).await?;
        ensure_active(stop)?;

        let stats =
            get_network_statistics(channel, self.probe_warmup, self.probe_samples, stop).await?;
        ensure_active(stop)?;

        wait_for_command_request(channel, stop).await?;
        ensure_active(stop)?;

        eliminate()?;
        ensure_active(stop)?;

        let frame = self.plan.payload().await.encode()?;
        ensure_active(stop)?;
        channel.send_text(frame).await?;
        info!("Launch requested: {}", self.plan.config.launch_uri());

        wait_for_command_request(channel, stop).await?;
        Ok(stats)
    }
}
