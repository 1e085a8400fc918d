//! Automatic reconnection around [`Player`].
//!
//! A [`Supervisor`] opens a fresh player, waits for its run to end, closes
//! it and tries again after a fixed delay, until [`Supervisor::close`] is
//! called. Errors from a single run are logged and turned into a retry;
//! they never end the supervisor.
//!
//! State transitions are published on a watch channel:
//!
//! ```text
//! Closed -> Opening -> Running -> Closing -> (delay) -> Opening -> ...
//!                 \________________/
//!                 open failure skips Running
//! ```
//!
//! and the supervisor returns to `Closed` once stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::callbacks::MediaCallbacks;
use crate::configuration::{Destination, MediaOptions};
use crate::engine::MediaEngine;
use crate::error::PipelineError;
use crate::ffmpeg::FfmpegEngine;
use crate::player::Player;
use crate::worker::RunPhase;

/// The state of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoPlayerState {
    /// Not running; `run()` may be called.
    Closed,
    /// A player is being opened.
    Opening,
    /// The current player's container-begin event fired.
    Running,
    /// The current player is being closed, or the retry delay is pending.
    Closing,
}

/// Keeps a [`Player`] running across stream failures.
///
/// Share it through an `Arc`: one task awaits [`run`](Self::run) while
/// another calls [`close`](Self::close).
pub struct Supervisor {
    address: String,
    destination: Option<Destination>,
    callbacks: Option<MediaCallbacks>,
    options: MediaOptions,
    engine: Arc<dyn MediaEngine>,
    state: watch::Sender<AutoPlayerState>,
    stop: watch::Sender<bool>,
    attempts: AtomicU64,
    runs: AtomicU64,
}

async fn phase_reached(phase: &mut watch::Receiver<RunPhase>, target: impl Fn(&RunPhase) -> bool) {
    let _ = phase.wait_for(target).await;
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn is_stopping(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

impl Supervisor {
    /// A closed supervisor for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            destination: None,
            callbacks: None,
            options: MediaOptions::default(),
            engine: Arc::new(FfmpegEngine::new()),
            state: watch::Sender::new(AutoPlayerState::Closed),
            stop: watch::Sender::new(false),
            attempts: AtomicU64::new(0),
            runs: AtomicU64::new(0),
        }
    }

    /// Re-mux every run to `destination`.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Callbacks forwarded to every player.
    pub fn with_callbacks(mut self, callbacks: MediaCallbacks) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Options of every player; `reconnect_delay` sets the retry delay.
    pub fn with_options(mut self, options: MediaOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a custom media engine.
    pub fn with_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// The current state.
    pub fn state(&self) -> AutoPlayerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<AutoPlayerState> {
        self.state.subscribe()
    }

    /// Number of players opened so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Number of players that got past their container-begin callback.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    fn label(&self) -> String {
        format!(
            "Supervisor[name='{}']",
            self.options.name.as_deref().unwrap_or_default()
        )
    }

    fn set_state(&self, state: AutoPlayerState) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            log::debug!("{} state -> {:?}", self.label(), state);
        }
    }

    /// Move `Closed -> Opening` and clear the stop flag in one step under
    /// the state lock; returns the state found otherwise.
    fn claim(&self) -> Result<(), AutoPlayerState> {
        let mut found = AutoPlayerState::Closed;
        self.state.send_if_modified(|state| {
            found = *state;
            if *state != AutoPlayerState::Closed {
                return false;
            }
            self.stop.send_replace(false);
            *state = AutoPlayerState::Opening;
            true
        });
        match found {
            AutoPlayerState::Closed => {
                log::debug!("{} state -> {:?}", self.label(), AutoPlayerState::Opening);
                Ok(())
            }
            state => Err(state),
        }
    }

    fn new_player(&self, runtime: Handle) -> Player {
        let mut player = Player::new(self.address.clone())
            .with_options(self.options.clone())
            .with_engine(self.engine.clone())
            .with_runtime(runtime);
        if let Some(destination) = &self.destination {
            player = player.with_destination(destination.clone());
        }
        if let Some(callbacks) = &self.callbacks {
            player = player.with_callbacks(callbacks.clone());
        }
        player
    }

    /// Run players back to back until [`close`](Self::close) is called.
    ///
    /// # Errors
    ///
    /// [`PipelineError::IllegalState`] unless the state is
    /// [`AutoPlayerState::Closed`].
    pub async fn run(&self) -> Result<(), PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        self.claim()
            .map_err(|state| PipelineError::IllegalState { state })?;

        let mut stop = self.stop.subscribe();
        let label = self.label();

        while !is_stopping(&stop) {
            self.set_state(AutoPlayerState::Opening);
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let mut player = self.new_player(runtime.clone());
            let opened = tokio::task::spawn_blocking(move || {
                let result = player.open();
                (player, result)
            })
            .await;
            let player = match opened {
                Ok((player, Ok(()))) => {
                    self.watch_run(&player, &mut stop).await;
                    Some(player)
                }
                Ok((_, Err(error))) => {
                    log::error!("{} Failed to open: {}", label, error);
                    None
                }
                Err(error) => {
                    log::error!("{} Open task failed: {}", label, error);
                    None
                }
            };

            self.set_state(AutoPlayerState::Closing);
            if let Some(mut player) = player {
                let closed = tokio::task::spawn_blocking(move || player.close_if_open()).await;
                match closed {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => log::error!("{} Run failed: {}", label, error),
                    Err(error) => log::error!("{} Close task failed: {}", label, error),
                }
            }

            if is_stopping(&stop) {
                break;
            }
            log::info!("{} Reconnecting in {:?}", label, self.options.reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = stop_requested(&mut stop) => {}
            }
        }

        self.set_state(AutoPlayerState::Closed);
        log::info!("{} Stopped after {} attempt(s)", label, self.attempts());
        Ok(())
    }

    async fn watch_run(&self, player: &Player, stop: &mut watch::Receiver<bool>) {
        let Some(mut phase) = player.phase() else {
            return;
        };

        tokio::select! {
            _ = phase_reached(&mut phase, |phase| *phase != RunPhase::Opening) => {}
            _ = stop_requested(stop) => return,
        }
        // A short run may already be `Finished`; the begin flag survives it.
        if player.has_begun() {
            self.runs.fetch_add(1, Ordering::Relaxed);
            self.set_state(AutoPlayerState::Running);
        }

        tokio::select! {
            _ = phase_reached(&mut phase, |phase| *phase == RunPhase::Finished) => {}
            _ = stop_requested(stop) => {}
        }
    }

    /// Ask [`run`](Self::run) to stop; it returns once the current player
    /// is closed.
    ///
    /// # Errors
    ///
    /// [`PipelineError::IllegalState`] if the state is
    /// [`AutoPlayerState::Closed`].
    pub fn close(&self) -> Result<(), PipelineError> {
        let mut closed = false;
        // Under the state lock, so a racing `run()` cannot clear the request.
        self.state.send_if_modified(|state| {
            closed = *state == AutoPlayerState::Closed;
            if !closed {
                self.stop.send_replace(true);
            }
            false
        });
        if closed {
            return Err(PipelineError::IllegalState {
                state: AutoPlayerState::Closed,
            });
        }
        log::debug!("{} Stop requested", self.label());
        Ok(())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .field("runs", &self.runs())
            .finish()
    }
}
