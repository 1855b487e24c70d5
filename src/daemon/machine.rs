//! Consumer daemon state machine

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{Result, XferError};
use crate::mapping::MappedRegion;
use crate::memory::page_size;
use crate::protocol::XferInfo;
use crate::sync::ShutdownFlag;
use crate::transport::{ControlChannel, Connector};

use super::clock::{Clock, SystemClock};
use super::config::{AccessMode, DaemonConfig};
use super::inspect::{hex_dump, Verification};
use super::state::{DaemonState, DaemonStats, Tick};

/// Longest single sleep in [`ConsumerDaemon::run`] before shutdown is rechecked
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Verbose mode dumps whole items up to this size, a prefix beyond it
const FULL_DUMP_LIMIT: usize = 1024;
const PARTIAL_DUMP_LEN: usize = 64;

/// Bytes of the head item as the daemon sees them
enum ItemView {
    Mapped(MappedRegion),
    Copied(Vec<u8>),
}

impl ItemView {
    fn as_slice(&self) -> &[u8] {
        match self {
            ItemView::Mapped(region) => region.as_slice(),
            ItemView::Copied(bytes) => bytes,
        }
    }
}

/// Head item being worked on
struct Work {
    info: XferInfo,
    view: Option<ItemView>,
    verification: Option<Verification>,
}

/// Long-running consumer: poll, map, inspect, release, repeat
///
/// Each call to [`step`](Self::step) performs the action of the current
/// state and moves to the next. Failures never end the loop; they lead to
/// [`DaemonState::ErrorBackoff`], which pauses briefly or, after
/// `error_threshold` consecutive failures, for the longer cool-down.
pub struct ConsumerDaemon<C: Connector, K: Clock = SystemClock> {
    connector: C,
    channel: Option<C::Channel>,
    config: DaemonConfig,
    clock: K,
    shutdown: ShutdownFlag,
    state: DaemonState,
    work: Option<Work>,
    consecutive_errors: u32,
    backoff: Duration,
    started: Instant,
    last_health_check: Instant,
    ever_connected: bool,
    stats: DaemonStats,
}

impl<C: Connector> ConsumerDaemon<C, SystemClock> {
    pub fn new(connector: C, config: DaemonConfig) -> Result<Self> {
        Self::with_clock(connector, config, SystemClock)
    }
}

impl<C: Connector, K: Clock> ConsumerDaemon<C, K> {
    pub fn with_clock(connector: C, config: DaemonConfig, clock: K) -> Result<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            connector,
            channel: None,
            config,
            clock,
            shutdown: ShutdownFlag::new(),
            state: DaemonState::Idle,
            work: None,
            consecutive_errors: 0,
            backoff: Duration::ZERO,
            started: now,
            last_health_check: now,
            ever_connected: false,
            stats: DaemonStats::default(),
        })
    }

    /// Use an externally owned shutdown flag, e.g. one set by a signal handler
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Drive the state machine until shutdown
    pub fn run(&mut self) -> DaemonStats {
        info!(
            "Consumer daemon started ({:?} access, poll timeout {:?})",
            self.config.access_mode, self.config.poll_timeout
        );
        loop {
            match self.step() {
                Tick::Continue => {}
                Tick::Sleep(duration) => self.sleep_interruptible(duration),
                Tick::Stopped => break,
            }
        }
        info!(
            "Consumer daemon stopped after {:?}: {} processed, {} empty, {} errors",
            self.clock.now().saturating_duration_since(self.started),
            self.stats.processed,
            self.stats.empty_items,
            self.stats.errors
        );
        self.stats.clone()
    }

    /// Perform one state's action
    pub fn step(&mut self) -> Tick {
        let before = self.state;
        let tick = match self.state {
            DaemonState::Idle => self.on_idle(),
            DaemonState::Polling => self.on_polling(),
            DaemonState::HasWork => self.on_has_work(),
            DaemonState::Mapped => self.on_mapped(),
            DaemonState::Verifying => self.on_verifying(),
            DaemonState::Releasing => self.on_releasing(),
            DaemonState::ErrorBackoff => self.on_backoff(),
            DaemonState::Stopped => Tick::Stopped,
        };
        if before != self.state {
            debug!("daemon {} -> {}", before.name(), self.state.name());
        }
        tick
    }

    fn on_idle(&mut self) -> Tick {
        if self.shutdown.is_requested() {
            self.stop();
            return Tick::Stopped;
        }

        if self.clock.now().saturating_duration_since(self.last_health_check)
            >= self.config.health_check_interval
        {
            self.health_check();
        }

        if self.channel.is_none() {
            match self.connector.connect() {
                Ok(channel) => {
                    if self.ever_connected {
                        self.stats.reconnects += 1;
                        info!("Control channel reopened");
                    }
                    self.ever_connected = true;
                    self.channel = Some(channel);
                }
                Err(e) => {
                    error!("Failed to open control channel: {}", e);
                    return self.fail(e);
                }
            }
        }

        self.state = DaemonState::Polling;
        Tick::Continue
    }

    fn on_polling(&mut self) -> Tick {
        let poll_timeout = self.config.poll_timeout;
        let Some(channel) = self.channel.as_mut() else {
            self.state = DaemonState::Idle;
            return Tick::Continue;
        };

        match channel.count() {
            Ok(0) => {
                self.consecutive_errors = 0;
                match channel.wait_readable(poll_timeout) {
                    Ok(_) => {
                        self.state = DaemonState::Idle;
                        Tick::Continue
                    }
                    Err(e) => {
                        error!("Readiness wait failed: {}", e);
                        self.fail(e)
                    }
                }
            }
            Ok(count) => {
                self.consecutive_errors = 0;
                debug!("{} item(s) pending", count);
                self.state = DaemonState::HasWork;
                Tick::Continue
            }
            Err(e) => {
                error!("Failed to get transfer count: {}", e);
                self.fail(e)
            }
        }
    }

    fn on_has_work(&mut self) -> Tick {
        let access_mode = self.config.access_mode;
        let max_map_len = self.config.max_map_len;
        let Some(channel) = self.channel.as_mut() else {
            self.state = DaemonState::Idle;
            return Tick::Continue;
        };

        let info = match channel.info() {
            Ok(info) => info,
            Err(XferError::NoItem) => {
                debug!("Head item vanished before it could be inspected");
                self.state = DaemonState::Idle;
                return Tick::Continue;
            }
            Err(e) => {
                error!("Failed to get transfer info: {}", e);
                return self.fail(e);
            }
        };

        info!(
            "Processing transfer: offset={}, size={}, frame={}",
            info.offset, info.size, info.frame_id
        );

        if info.is_empty() {
            debug!("Empty item, releasing without mapping");
            self.stats.empty_items += 1;
            self.work = Some(Work {
                info,
                view: None,
                verification: None,
            });
            self.state = DaemonState::Releasing;
            return Tick::Continue;
        }

        let len = clamp_map_len(info.size, max_map_len);
        if (len as u64) < info.size {
            warn!("Transfer size {} capped at {}", info.size, len);
        }

        let view = match access_mode {
            AccessMode::Map => channel.map_head(len).map(ItemView::Mapped).map_err(|e| {
                self.stats.map_failures += 1;
                e
            }),
            AccessMode::Read => read_all(channel, len).map(ItemView::Copied).map_err(|e| {
                self.stats.read_failures += 1;
                e
            }),
        };

        match view {
            Ok(view) => {
                self.work = Some(Work {
                    info,
                    view: Some(view),
                    verification: None,
                });
                self.state = DaemonState::Mapped;
                Tick::Continue
            }
            Err(e) => {
                error!("Failed to access head item: {}", e);
                self.stats.errors += 1;
                self.consecutive_errors += 1;
                if e.is_disconnect() {
                    self.channel = None;
                    return self.enter_backoff();
                }
                // The item is released anyway so one bad page cannot wedge the queue
                self.work = Some(Work {
                    info,
                    view: None,
                    verification: None,
                });
                self.state = DaemonState::Releasing;
                Tick::Continue
            }
        }
    }

    fn on_mapped(&mut self) -> Tick {
        let preview_len = self.config.preview_len;
        if let Some(work) = self.work.as_mut() {
            if let Some(view) = work.view.as_ref() {
                let data = view.as_slice();
                let verification = Verification::inspect(data, preview_len);
                info!("Content preview: {}", verification.preview);
                self.stats.bytes += data.len() as u64;
                work.verification = Some(verification);
            }
        }
        self.state = DaemonState::Verifying;
        Tick::Continue
    }

    fn on_verifying(&mut self) -> Tick {
        let verbose = self.config.verbose;
        let mut view = None;
        if let Some(work) = self.work.as_mut() {
            if let Some(verification) = work.verification.as_ref() {
                info!(
                    "Verified frame {}: {} bytes, crc32={:08x}",
                    work.info.frame_id, verification.size, verification.crc32
                );
                if verbose {
                    if let Some(item) = work.view.as_ref() {
                        let data = item.as_slice();
                        let shown = if data.len() <= FULL_DUMP_LIMIT {
                            data
                        } else {
                            &data[..PARTIAL_DUMP_LEN]
                        };
                        info!("Hex dump ({} of {} bytes):\n{}", shown.len(), data.len(), hex_dump(shown));
                    }
                }
            }
            view = work.view.take();
        }

        if let Some(ItemView::Mapped(region)) = view {
            drop(region);
            if let Some(channel) = self.channel.as_mut() {
                if let Err(e) = channel.unmap() {
                    warn!("Failed to drop mapping: {}", e);
                }
            }
        }

        self.state = DaemonState::Releasing;
        Tick::Continue
    }

    fn on_releasing(&mut self) -> Tick {
        let Some(channel) = self.channel.as_mut() else {
            self.work = None;
            self.state = DaemonState::Idle;
            return Tick::Continue;
        };

        match channel.release_head() {
            Ok(()) => {
                self.stats.releases += 1;
                if let Some(work) = self.work.take() {
                    if work.verification.is_some() {
                        self.stats.processed += 1;
                    }
                    debug!("Released frame {}", work.info.frame_id);
                }
                self.consecutive_errors = 0;
                self.state = DaemonState::Idle;
                Tick::Continue
            }
            Err(e) => {
                error!("Failed to release transfer: {}", e);
                self.fail(e)
            }
        }
    }

    fn on_backoff(&mut self) -> Tick {
        self.state = DaemonState::Idle;
        Tick::Sleep(self.backoff)
    }

    fn fail(&mut self, e: XferError) -> Tick {
        self.stats.errors += 1;
        self.consecutive_errors += 1;
        if e.is_disconnect() {
            warn!("Control channel lost: {}", e);
            self.channel = None;
        }
        self.enter_backoff()
    }

    fn enter_backoff(&mut self) -> Tick {
        // Mapped views are dropped before anything else happens
        if let Some(work) = self.work.take() {
            if let Some(ItemView::Mapped(_)) = work.view {
                if let Some(channel) = self.channel.as_mut() {
                    if let Err(e) = channel.unmap() {
                        warn!("Failed to drop mapping before backoff: {}", e);
                    }
                }
            }
        }

        if self.consecutive_errors >= self.config.error_threshold {
            error!(
                "{} consecutive errors, cooling down for {:?}",
                self.consecutive_errors, self.config.cooldown
            );
            self.stats.cooldowns += 1;
            self.consecutive_errors = 0;
            self.backoff = self.config.cooldown;
        } else {
            self.backoff = self.config.short_backoff;
        }
        self.state = DaemonState::ErrorBackoff;
        Tick::Continue
    }

    fn health_check(&mut self) {
        let now = self.clock.now();
        self.last_health_check = now;
        self.stats.health_checks += 1;

        let uptime = now.saturating_duration_since(self.started);
        info!(
            "Health check: uptime {}s, {} transfers ({:.1}/min)",
            uptime.as_secs(),
            self.stats.processed + self.stats.empty_items,
            self.stats.rate_per_minute(uptime)
        );

        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.ping() {
                warn!("Control channel failed health check: {}", e);
                self.channel = None;
            }
        }
    }

    fn stop(&mut self) {
        info!("Shutdown requested");
        self.work = None;
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.unmap() {
                warn!("Failed to drop mapping on shutdown: {}", e);
            }
        }
        self.state = DaemonState::Stopped;
    }

    fn sleep_interruptible(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() && !self.shutdown.is_requested() {
            let slice = remaining.min(SLEEP_SLICE);
            self.clock.sleep(slice);
            remaining -= slice;
        }
    }
}

/// Length to request for an item of `size` bytes
fn clamp_map_len(size: u64, max_map_len: usize) -> usize {
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    size.min(max_map_len).min(page_size())
}

fn read_all<H: ControlChannel>(channel: &mut H, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = channel.read_head(filled as u64, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
