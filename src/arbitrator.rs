//! Races one connection attempt per offer and keeps the first to finish the handshake

use crate::config::Config;
use crate::directory::{Directory, NodeQuery};
use crate::error::{Error, Result};
use crate::peer::data_channel::{ChannelRole, DataChannel};
use crate::peer::link::{ChannelStream, Connector, LinkHandle};
use crate::peer::state::LinkState;
use crate::peer::types::NodeOffer;
use crate::session::frames::ControlFrame;
use crate::session::handshake::ControlHandshake;
use crate::session::launch::{CredentialSource, LaunchConfig, LaunchPlan};
use crate::stop::{StopCode, StopSignal};
use crate::utils::random_id;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

/// Handles a non-control channel for the lifetime of a session
#[async_trait]
pub trait ChannelService: Send + Sync {
    async fn serve(&self, channel: DataChannel, stop: StopSignal) -> Result<()>;
}

/// Optional handlers for the side channels a node may open
#[derive(Clone, Default)]
pub struct ChannelServices {
    pub persistence: Option<Arc<dyn ChannelService>>,
    pub auth: Option<Arc<dyn ChannelService>>,
}

/// Collaborators of one launcher
pub struct LaunchContext {
    pub config: Config,
    pub directory: Arc<dyn Directory>,
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialSource>,
    pub services: ChannelServices,
}

struct Attempt {
    id: usize,
    session_id: String,
    stop: StopSignal,
}

/// Attempts still in the race
#[derive(Default)]
pub struct AttemptSet {
    attempts: Mutex<Vec<Attempt>>,
}

impl AttemptSet {
    fn lock(&self) -> MutexGuard<'_, Vec<Attempt>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: usize, session_id: &str, stop: StopSignal) {
        self.lock().push(Attempt {
            id,
            session_id: session_id.to_string(),
            stop,
        });
    }

    /// Declare `winner`: stop every other attempt with `ConcurrentSession`
    /// and leave `winner` alone in the set. Fails if `winner` was already
    /// eliminated or stopped.
    pub fn kill_others(&self, winner: usize) -> Result<()> {
        let mut attempts = self.lock();
        let Some(current) = attempts.iter().find(|a| a.id == winner) else {
            return Err(Error::ConcurrentSessionSuperseded);
        };
        if current.stop.is_stopped() {
            return Err(Error::ConcurrentSessionSuperseded);
        }

        for attempt in attempts.iter().filter(|a| a.id != winner) {
            attempt.stop.stop_with(StopCode::ConcurrentSession);
        }
        attempts.retain(|a| a.id == winner);
        info!(session_id = %attempts[0].session_id, "We have a winner: {}", winner);
        Ok(())
    }

    /// Drop `id`; returns the number left when it was present
    fn remove(&self, id: usize) -> Option<usize> {
        let mut attempts = self.lock();
        let index = attempts.iter().position(|a| a.id == id)?;
        attempts.remove(index);
        Some(attempts.len())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum AttemptEvent {
    /// Won the elimination step
    Won,
    Finished { id: usize, result: Result<i32> },
}

/// Everything an attempt task needs
struct RaceEnv {
    connector: Arc<dyn Connector>,
    services: ChannelServices,
    plan: LaunchPlan,
    set: AttemptSet,
    events: mpsc::UnboundedSender<AttemptEvent>,
    probe_warmup: usize,
    probe_samples: usize,
    stall_timeout: Duration,
}

pub struct Arbitrator {
    ctx: Arc<LaunchContext>,
    stop: StopSignal,
}

impl Arbitrator {
    pub fn new(ctx: Arc<LaunchContext>) -> Self {
        Self::with_stop(ctx, StopSignal::new())
    }

    /// Stopping `stop` ends every attempt and a live session with its code
    pub fn with_stop(ctx: Arc<LaunchContext>, stop: StopSignal) -> Self {
        Self { ctx, stop }
    }

    /// Find nodes for `request` and race them. Returns the session's exit code.
    ///
    /// `overall_timeout` covers the directory lookup as well as the race.
    pub async fn launch(&self, mut request: LaunchConfig) -> Result<i32> {
        let timeout = self.ctx.config.race.overall_timeout;
        let deadline = Instant::now() + timeout;
        let session_id = request.session_id.get_or_insert_with(random_id).clone();
        info!(session_id = %session_id, "Launching {}", request.launch_uri());

        let lookup = self.stop.child();
        let (persistence_root, offers) = tokio::select! {
            prepared = self.prepare(&request, &lookup) => prepared?,
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Directory lookup did not finish within {:?}", timeout);
                lookup.stop_with(StopCode::ConnectionTimeout);
                return Err(Error::Timeout);
            }
        };
        if offers.is_empty() {
            return Err(Error::NoNodesAvailable);
        }

        let plan = LaunchPlan::new(request, Arc::clone(&self.ctx.credentials))
            .with_persistence_root(persistence_root);
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.race(offers, plan, remaining).await
    }

    /// Persistence root (when signed in) and the current listing
    async fn prepare(
        &self,
        request: &LaunchConfig,
        stop: &StopSignal,
    ) -> Result<(Option<String>, Vec<NodeOffer>)> {
        let credentials = &self.ctx.credentials;
        let persistence_root = if credentials.is_logged_in() {
            credentials.persistence_root(&request.launch_uri()).await?
        } else {
            None
        };

        let query =
            NodeQuery::default().versions(request.node_min.clone(), request.node_max.clone());
        let offers = self.ctx.directory.list_nodes(&query, stop).await?;
        Ok((persistence_root, offers))
    }

    /// Negotiate with every offer at once; the first attempt through the
    /// elimination step wins and the others are stopped. `timeout` bounds
    /// the time until a winner is declared.
    pub async fn race(
        &self,
        offers: Vec<NodeOffer>,
        plan: LaunchPlan,
        timeout: Duration,
    ) -> Result<i32> {
        if offers.is_empty() {
            return Err(Error::NoNodesAvailable);
        }

        let race_stop = self.stop.child();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let race = &self.ctx.config.race;
        let env = Arc::new(RaceEnv {
            connector: Arc::clone(&self.ctx.connector),
            services: self.ctx.services.clone(),
            plan,
            set: AttemptSet::default(),
            events: events_tx,
            probe_warmup: race.probe_warmup,
            probe_samples: race.probe_samples,
            stall_timeout: race.stall_timeout,
        });

        let mut tasks = JoinSet::new();
        for (id, offer) in offers.into_iter().enumerate() {
            let stop = race_stop.child();
            env.set.insert(id, &offer.session_id, stop.clone());
            tasks.spawn(attempt_task(Arc::clone(&env), id, offer, stop));
        }

        let outcome = arbitrate(&env.set, &mut events, tokio::time::sleep(timeout)).await;
        if matches!(outcome, Err(Error::Timeout)) {
            warn!("No node became ready within {:?}", timeout);
            race_stop.stop_with(StopCode::ConnectionTimeout);
        }

        race_stop.stop_with(StopCode::GeneralError);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Attempt task panicked: {}", e);
            }
        }
        outcome
    }
}

/// Consume attempt events until the race is decided. `deadline` only counts
/// until an attempt wins elimination; events already queued take precedence.
async fn arbitrate(
    set: &AttemptSet,
    events: &mut mpsc::UnboundedReceiver<AttemptEvent>,
    deadline: impl Future<Output = ()>,
) -> Result<i32> {
    tokio::pin!(deadline);
    let mut won = false;

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(AttemptEvent::Won) => won = true,
                Some(AttemptEvent::Finished { id, result: Ok(code) }) => {
                    info!("Attempt {} finished with {}", id, StopCode::from_code(code));
                    return Ok(code);
                }
                Some(AttemptEvent::Finished { id, result: Err(e) }) if e.is_superseded() => {
                    debug!("Attempt {} superseded", id);
                    set.remove(id);
                }
                Some(AttemptEvent::Finished { id, result: Err(e) }) => {
                    error!("Attempt {} failed: {}", id, e);
                    // The set only empties through failures, so this one is the last.
                    if set.remove(id) == Some(0) {
                        return Err(e);
                    }
                }
                // The race keeps a sender, so this only happens if every task panicked
                None => return Err(Error::NegotiationFailed("attempts vanished".to_string())),
            },
            _ = &mut deadline, if !won => return Err(Error::Timeout),
        }
    }
}

async fn attempt_task(env: Arc<RaceEnv>, id: usize, offer: NodeOffer, stop: StopSignal) {
    let result = run_attempt(&env, id, &offer, &stop).await;
    let result = match result {
        Err(_) if stop.code() == Some(StopCode::CONCURRENT_SESSION) => {
            Err(Error::ConcurrentSessionSuperseded)
        }
        other => other,
    };
    let _ = env.events.send(AttemptEvent::Finished { id, result });
}

async fn run_attempt(
    env: &Arc<RaceEnv>,
    id: usize,
    offer: &NodeOffer,
    stop: &StopSignal,
) -> Result<i32> {
    let link = env.connector.connect(offer, stop).await?;
    let (channels, handle) = link.split();

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let router = tokio::spawn(route_channels(
        channels,
        control_tx,
        env.services.clone(),
        env.plan.clone(),
        stop.clone(),
    ));

    let result = drive_control(env, id, control_rx, &handle, stop).await;
    router.abort();
    handle.close().await;
    result
}

async fn drive_control(
    env: &Arc<RaceEnv>,
    id: usize,
    mut control_rx: mpsc::UnboundedReceiver<DataChannel>,
    handle: &LinkHandle,
    stop: &StopSignal,
) -> Result<i32> {
    let mut control = tokio::select! {
        biased;
        code = stop.stopped() => return Err(Error::Stopped(code)),
        state = handle.terminated() => {
            return Err(Error::ChannelClosed(format!("link {:?} before control channel", state)));
        }
        channel = control_rx.recv() => channel.ok_or_else(|| {
            Error::ChannelClosed("link ended without a control channel".to_string())
        })?,
    };

    let handshake = ControlHandshake {
        plan: &env.plan,
        probe_warmup: env.probe_warmup,
        probe_samples: env.probe_samples,
    };
    let eliminate = {
        let env = Arc::clone(env);
        move || {
            env.set.kill_others(id)?;
            let _ = env.events.send(AttemptEvent::Won);
            Ok(())
        }
    };
    tokio::select! {
        result = handshake.run(&mut control, stop, eliminate) => {
            result?;
        }
        state = handle.terminated() => {
            return Err(Error::ChannelClosed(format!("link {:?} during handshake", state)));
        }
    }

    info!(session_id = handle.session_id(), "Session is live");
    Ok(supervise(&mut control, handle, stop, env.stall_timeout).await)
}

/// Watch a live session until it exits. Returns the exit code.
async fn supervise(
    control: &mut DataChannel,
    handle: &LinkHandle,
    stop: &StopSignal,
    stall_timeout: Duration,
) -> i32 {
    let mut state = handle.watch();
    let mut stall: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            frame = control.recv() => match frame.as_ref().map(ControlFrame::parse) {
                Some(ControlFrame::Exit(code)) => {
                    info!("Remote exited with code {}", code);
                    stop.stop(code);
                    return code;
                }
                Some(ControlFrame::Status(text)) => info!("Status: {}", text),
                Some(ControlFrame::Chat(text)) => info!("Chat: {}", text),
                Some(ControlFrame::Ready) => debug!("Late command request"),
                Some(ControlFrame::Unrecognized(raw)) => {
                    debug!("Unrecognized control frame ({} bytes)", raw.len())
                }
                None => {
                    warn!("Control channel closed");
                    stop.stop_with(StopCode::GeneralError);
                    return stop.code().unwrap_or(StopCode::GENERAL_ERROR);
                }
            },
            code = stop.stopped() => return code,
            changed = state.changed() => {
                let current = match changed {
                    Ok(()) => *state.borrow_and_update(),
                    Err(_) => LinkState::Closed,
                };
                match current {
                    LinkState::Disconnected => {
                        if stall.is_none() {
                            warn!("Link stalled, waiting {:?} for recovery", stall_timeout);
                            stall = Some(Box::pin(tokio::time::sleep(stall_timeout)));
                        }
                    }
                    LinkState::Connected => {
                        if stall.take().is_some() {
                            info!("Link recovered");
                        }
                    }
                    LinkState::Failed | LinkState::Closed => {
                        stop.stop_with(StopCode::GeneralError);
                        return stop.code().unwrap_or(StopCode::GENERAL_ERROR);
                    }
                    LinkState::Connecting => {}
                }
            }
            _ = async {
                if let Some(timer) = stall.as_mut() {
                    timer.as_mut().await;
                }
            }, if stall.is_some() => {
                stop.stop_with(StopCode::ConnectionTimeout);
                return stop.code().unwrap_or(StopCode::CONNECTION_TIMEOUT);
            }
        }
    }
}

async fn route_channels(
    mut channels: ChannelStream,
    control_tx: mpsc::UnboundedSender<DataChannel>,
    services: ChannelServices,
    plan: LaunchPlan,
    stop: StopSignal,
) {
    let mut control = Some(control_tx);
    let logged_in = plan.credentials.is_logged_in();

    loop {
        let channel = tokio::select! {
            channel = channels.next() => channel,
            _ = stop.stopped() => None,
        };
        let Some(channel) = channel else {
            break;
        };

        match channel.role().clone() {
            ChannelRole::Control => match control.take() {
                Some(tx) => {
                    let _ = tx.send(channel);
                }
                None => warn!("Ignoring extra control channel"),
            },
            ChannelRole::Persistence => match (&services.persistence, &plan.persistence_root) {
                (Some(service), Some(_)) if logged_in => {
                    info!("Persistence enabled");
                    spawn_service(Arc::clone(service), channel, stop.clone());
                }
                _ => warn!("Persistence not available"),
            },
            ChannelRole::Auth => match &services.auth {
                Some(service) if logged_in => {
                    info!("Auth enabled");
                    spawn_service(Arc::clone(service), channel, stop.clone());
                }
                _ => warn!("Auth not available"),
            },
            ChannelRole::Other(label) => debug!("Ignoring channel {}", label),
        }
    }
}

fn spawn_service(service: Arc<dyn ChannelService>, channel: DataChannel, stop: StopSignal) {
    let label = channel.label().to_string();
    tokio::spawn(async move {
        if let Err(e) = service.serve(channel, stop).await {
            warn!("{} service ended: {}", label, e);
        }
    });
}
