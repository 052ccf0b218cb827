// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IPv4 Address Conflict Detection as defined by [RFC 5227].
//!
//! A detector probes the local link for a candidate address, announces the
//! claim when the probes go unanswered, and afterwards defends the address
//! against later claimants. It is driven entirely by its bindings context:
//! timers fire into its [`TimerHandler`] implementation and socket readiness
//! is reported through [`Ipv4Acd::handle_socket_readable`].
//!
//! [RFC 5227]: https://datatracker.ietf.org/doc/html/rfc5227

use core::num::NonZeroU64;
use core::time::Duration;
use std::io;

use net_types::ethernet::Mac;
use net_types::ip::Ipv4Addr;
use net_types::{SpecifiedAddr, UnicastAddr};
use rand::Rng as _;
use tracing::{debug, warn};

use crate::arp::{ArpFrame, ARP_FRAME_LEN};
use crate::context::{EventContext, InstantContext, RngContext, TimerContext, TimerHandler};
use crate::socket::{ArpSocket, ArpSocketContext};
use crate::time::Instant as _;

/// Upper bound of the random delay inserted before the first probe, as
/// defined in [RFC 5227 section 1.1].
///
/// The delay spreads out hosts that power on at the same instant, e.g. after
/// an outage.
///
/// [RFC 5227 section 1.1]: https://datatracker.ietf.org/doc/html/rfc5227#section-1.1
pub const PROBE_WAIT: Duration = Duration::from_secs(1);

/// Number of probes sent before the candidate address is considered
/// unclaimed, as defined in [RFC 5227 section 1.1].
///
/// [RFC 5227 section 1.1]: https://datatracker.ietf.org/doc/html/rfc5227#section-1.1
pub const PROBE_NUM: usize = 3;

/// Minimum spacing between consecutive probes.
pub const PROBE_MIN: Duration = Duration::from_secs(1);

/// Maximum (exclusive) spacing between consecutive probes.
pub const PROBE_MAX: Duration = Duration::from_secs(2);

/// Delay from the last probe to the first announcement.
pub const ANNOUNCE_WAIT: Duration = Duration::from_secs(2);

/// Number of announcements sent once the claim succeeds.
pub const ANNOUNCE_NUM: usize = 2;

/// Spacing between consecutive announcements.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// Number of conflict-triggered resets after which probing is rate limited,
/// as defined in [RFC 5227 section 1.1].
///
/// [RFC 5227 section 1.1]: https://datatracker.ietf.org/doc/html/rfc5227#section-1.1
pub const MAX_CONFLICTS: u32 = 10;

/// Cool-down inserted before the next probe cycle once [`MAX_CONFLICTS`] is
/// reached.
pub const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum gap between consecutive defensive announcements; a second
/// conflict observed inside the gap surrenders the address.
pub const DEFEND_INTERVAL: Duration = Duration::from_secs(10);

/// The identifier for the conflict detector's wake-up timer.
///
/// A detector keeps at most one timer pending; rescheduling under this ID
/// replaces the pending one.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct AcdTimerId;

/// Events delivered to the detector's client through
/// [`EventContext`](crate::context::EventContext).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcdEvent {
    /// The first announcement went out; the candidate address is now owned
    /// by this host.
    Bound,
    /// Another host is using the address. The detector has reset and must be
    /// reconfigured or restarted by the client.
    Conflict,
    /// The detector stopped, either through [`Ipv4Acd::stop`] or because of
    /// a fatal I/O error.
    Stopped,
}

/// The execution context required to run address conflict detection.
pub trait AcdBindingsContext:
    RngContext + TimerContext<AcdTimerId> + EventContext<AcdEvent> + ArpSocketContext
{
}
impl<BC> AcdBindingsContext for BC where
    BC: RngContext + TimerContext<AcdTimerId> + EventContext<AcdEvent> + ArpSocketContext
{
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Init,
    Started,
    WaitingProbe,
    Probing,
    WaitingAnnounce,
    Announcing,
    Running,
}

/// Error returned by configuration setters while detection is running.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("conflict detection is running; configuration requires a stopped detector")]
pub struct BusyError;

/// Errors returned by [`Ipv4Acd::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The detector is already running.
    #[error("conflict detection is already running")]
    Busy,
    /// The interface index, MAC address, or candidate address is missing.
    #[error("interface, MAC, and address must all be configured")]
    NotConfigured,
    /// Opening the raw ARP socket failed.
    #[error("failed to open raw ARP socket: {0}")]
    Socket(#[from] io::Error),
}

/// A single-address IPv4 conflict detector.
///
/// A detector is configured with an interface index, a MAC address, and a
/// candidate IPv4 address while stopped, then driven by its bindings context
/// from [`start`](Ipv4Acd::start) until it either binds the address
/// ([`AcdEvent::Bound`]), loses it ([`AcdEvent::Conflict`]), or is stopped
/// ([`AcdEvent::Stopped`]). After a conflict the client restarts it, usually
/// with a different candidate.
///
/// Events are emitted synchronously from within the handler that caused
/// them, while the detector is mutably borrowed; clients react to them after
/// the handler returns.
pub struct Ipv4Acd<BC: AcdBindingsContext> {
    state: State,
    iteration: usize,
    conflict_count: u32,
    ifindex: Option<NonZeroU64>,
    mac: Option<UnicastAddr<Mac>>,
    address: Option<SpecifiedAddr<Ipv4Addr>>,
    socket: Option<BC::Socket>,
    defend_window: Option<BC::Instant>,
}

impl<BC: AcdBindingsContext> Default for Ipv4Acd<BC> {
    fn default() -> Ipv4Acd<BC> {
        Ipv4Acd::new()
    }
}

impl<BC: AcdBindingsContext> Ipv4Acd<BC> {
    /// Creates a stopped, unconfigured detector.
    pub fn new() -> Ipv4Acd<BC> {
        Ipv4Acd {
            state: State::Init,
            iteration: 0,
            conflict_count: 0,
            ifindex: None,
            mac: None,
            address: None,
            socket: None,
            defend_window: None,
        }
    }

    /// Sets the index of the interface to claim the address on.
    ///
    /// Fails with [`BusyError`] unless the detector is stopped.
    pub fn set_ifindex(&mut self, ifindex: NonZeroU64) -> Result<(), BusyError> {
        self.check_stopped()?;
        self.ifindex = Some(ifindex);
        Ok(())
    }

    /// Sets the hardware address probes and announcements are sent with.
    ///
    /// Fails with [`BusyError`] unless the detector is stopped.
    pub fn set_mac(&mut self, mac: UnicastAddr<Mac>) -> Result<(), BusyError> {
        self.check_stopped()?;
        self.mac = Some(mac);
        Ok(())
    }

    /// Sets the candidate IPv4 address.
    ///
    /// Fails with [`BusyError`] unless the detector is stopped.
    pub fn set_address(&mut self, address: SpecifiedAddr<Ipv4Addr>) -> Result<(), BusyError> {
        self.check_stopped()?;
        self.address = Some(address);
        Ok(())
    }

    /// Returns the configured candidate address, if any.
    pub fn address(&self) -> Option<SpecifiedAddr<Ipv4Addr>> {
        self.address
    }

    /// Returns whether the detector is running.
    pub fn is_running(&self) -> bool {
        self.state != State::Init
    }

    /// Returns the open ARP socket while the detector is running.
    ///
    /// Bindings use this to register a readability watcher; the watcher's
    /// lifetime follows the socket's, which exists exactly while the
    /// detector runs.
    pub fn socket(&self) -> Option<&BC::Socket> {
        self.socket.as_ref()
    }

    /// Starts conflict detection for the configured candidate address.
    ///
    /// Opens the raw ARP socket and schedules an immediate wake-up; probing
    /// proper begins from that wake-up, after the randomized initial delay.
    /// On failure the detector is left fully stopped.
    pub fn start(&mut self, bindings_ctx: &mut BC) -> Result<(), StartError> {
        if self.state != State::Init {
            return Err(StartError::Busy);
        }
        let (ifindex, mac, address) = match (self.ifindex, self.mac, self.address) {
            (Some(ifindex), Some(mac), Some(address)) => (ifindex, mac, address),
            _ => return Err(StartError::NotConfigured),
        };

        let socket = bindings_ctx.open_raw_arp_socket(ifindex, address, mac)?;
        self.socket = Some(socket);
        self.defend_window = None;

        // Note that the conflict counter survives restarts; it is what the
        // rate limit in `Started` is measured against, and only the rate
        // limit itself or a successful claim clears it.
        let _: Option<BC::Instant> = bindings_ctx.schedule_timer(Duration::ZERO, AcdTimerId);
        self.set_state(State::Started, true);
        Ok(())
    }

    /// Stops the detector, releasing its timer and socket, and emits
    /// [`AcdEvent::Stopped`].
    pub fn stop(&mut self, bindings_ctx: &mut BC) {
        self.reset(bindings_ctx);
        debug!("stopped");
        bindings_ctx.on_event(AcdEvent::Stopped);
    }

    /// Handles readiness of the raw ARP socket.
    ///
    /// Reads at most one frame per call; bindings invoke this once per
    /// readiness notification. Transient receive errors are dropped and
    /// retried on the next notification, fatal ones stop the detector.
    pub fn handle_socket_readable(&mut self, bindings_ctx: &mut BC) {
        let Some(socket) = self.socket.as_mut() else {
            // Stale readiness delivered after a reset.
            return;
        };
        let mut buf = [0; ARP_FRAME_LEN];
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                return;
            }
            Err(e) => {
                warn!("failed to read ARP packet: {}", e);
                self.stop(bindings_ctx);
                return;
            }
        };
        if n != ARP_FRAME_LEN {
            debug!("ignoring short ARP packet ({} bytes)", n);
            return;
        }
        let Some(frame) = ArpFrame::parse(&buf) else {
            return;
        };
        self.on_packet(bindings_ctx, &frame);
    }

    /// Moves to `next`, resetting the repetition counter on a state change
    /// and counting a repetition on re-entry.
    fn set_state(&mut self, next: State, reset_iteration: bool) {
        if self.state == next && !reset_iteration {
            self.iteration += 1;
        } else {
            self.state = next;
            self.iteration = 0;
        }
    }

    /// Releases the timer and the socket and returns to the stopped state.
    fn reset(&mut self, bindings_ctx: &mut BC) {
        let _: Option<BC::Instant> = bindings_ctx.cancel_timer(AcdTimerId);
        self.socket = None;
        self.defend_window = None;
        self.set_state(State::Init, true);
    }

    fn check_stopped(&self) -> Result<(), BusyError> {
        if self.state == State::Init {
            Ok(())
        } else {
            Err(BusyError)
        }
    }

    fn claim(&self) -> (UnicastAddr<Mac>, SpecifiedAddr<Ipv4Addr>) {
        let mac = self.mac.expect("MAC address should be configured while started");
        let address = self.address.expect("candidate address should be configured while started");
        (mac, address)
    }

    fn socket_mut(&mut self) -> &mut BC::Socket {
        self.socket.as_mut().expect("socket should be open while started")
    }

    /// Schedules the next wake-up `base` from now, adding a uniform random
    /// draw from `[0, jitter)` when `jitter` is non-zero. Replaces any
    /// pending timer.
    fn schedule_next_wakeup(bindings_ctx: &mut BC, base: Duration, jitter: Duration) {
        let delay = if jitter.is_zero() {
            base
        } else {
            base + bindings_ctx.rng().gen_range(Duration::ZERO..jitter)
        };
        let _: Option<BC::Instant> = bindings_ctx.schedule_timer(delay, AcdTimerId);
    }

    fn on_timeout(&mut self, bindings_ctx: &mut BC) {
        match self.state {
            State::Started => {
                self.set_state(State::WaitingProbe, true);
                if self.conflict_count >= MAX_CONFLICTS {
                    debug!(
                        "max conflicts reached, delaying next probe cycle by {:?}",
                        RATE_LIMIT_INTERVAL
                    );
                    Self::schedule_next_wakeup(bindings_ctx, RATE_LIMIT_INTERVAL, PROBE_WAIT);
                    self.conflict_count = 0;
                } else {
                    Self::schedule_next_wakeup(bindings_ctx, Duration::ZERO, PROBE_WAIT);
                }
            }
            State::WaitingProbe | State::Probing => {
                let (mac, address) = self.claim();
                let frame = ArpFrame::probe(mac, address);
                if let Err(e) = self.socket_mut().send(&frame) {
                    warn!("failed to send ARP probe for {}: {}", address, e);
                    self.stop(bindings_ctx);
                    return;
                }
                debug!("probing {}", address);
                if self.iteration < PROBE_NUM - 2 {
                    self.set_state(State::Probing, false);
                    Self::schedule_next_wakeup(bindings_ctx, PROBE_MIN, PROBE_MAX - PROBE_MIN);
                } else {
                    self.set_state(State::WaitingAnnounce, true);
                    Self::schedule_next_wakeup(bindings_ctx, ANNOUNCE_WAIT, Duration::ZERO);
                }
            }
            State::WaitingAnnounce | State::Announcing => {
                if self.state == State::Announcing && self.iteration >= ANNOUNCE_NUM - 1 {
                    // The claim is fully announced. No further timer: from
                    // here on only packets wake the detector.
                    self.set_state(State::Running, false);
                    return;
                }
                let (mac, address) = self.claim();
                let frame = ArpFrame::announcement(mac, address);
                if let Err(e) = self.socket_mut().send(&frame) {
                    warn!("failed to send ARP announcement for {}: {}", address, e);
                    self.stop(bindings_ctx);
                    return;
                }
                debug!("announcing {}", address);
                self.set_state(State::Announcing, false);
                Self::schedule_next_wakeup(bindings_ctx, ANNOUNCE_INTERVAL, Duration::ZERO);
                if self.iteration == 0 {
                    self.conflict_count = 0;
                    bindings_ctx.on_event(AcdEvent::Bound);
                }
            }
            State::Init | State::Running => {
                // Stale dispatch: the timer was cancelled while this expiry
                // was already in flight.
                debug!("ignoring stale wake-up");
            }
        }
    }

    fn on_packet(&mut self, bindings_ctx: &mut BC, frame: &ArpFrame) {
        match self.state {
            State::Announcing | State::Running => {
                let (mac, address) = self.claim();
                if !frame.conflicts_with(address) {
                    return;
                }
                let now = bindings_ctx.now();
                match self.defend_window {
                    Some(deadline) if now <= deadline => {
                        // Second conflict within the defend window: the
                        // other claimant is persistent, surrender.
                        self.on_conflict(bindings_ctx);
                    }
                    _ => {
                        self.defend_window = Some(now.add(DEFEND_INTERVAL));
                        let defense = ArpFrame::announcement(mac, address);
                        if let Err(e) = self.socket_mut().send(&defense) {
                            warn!("failed to send defensive announcement for {}: {}", address, e);
                            self.stop(bindings_ctx);
                            return;
                        }
                        debug!("defending {}", address);
                    }
                }
            }
            State::WaitingProbe | State::Probing | State::WaitingAnnounce => {
                // The socket filter only passes frames that involve the
                // candidate address and come from another sender; while the
                // address is unclaimed any such frame means it is taken.
                self.on_conflict(bindings_ctx);
            }
            State::Init | State::Started => {
                // No probes are in flight yet (or the detector was reset
                // while the frame was queued); nothing to conclude.
            }
        }
    }

    fn on_conflict(&mut self, bindings_ctx: &mut BC) {
        let (_mac, address) = self.claim();
        self.conflict_count += 1;
        debug!("conflict on {} ({} seen)", address, self.conflict_count);
        self.reset(bindings_ctx);
        bindings_ctx.on_event(AcdEvent::Conflict);
    }
}

impl<BC: AcdBindingsContext> TimerHandler<BC, AcdTimerId> for Ipv4Acd<BC> {
    fn handle_timer(&mut self, bindings_ctx: &mut BC, AcdTimerId: AcdTimerId) {
        self.on_timeout(bindings_ctx)
    }
}
