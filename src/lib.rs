// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![deny(missing_docs)]
//! A platform-agnostic implementation of IPv4 Address Conflict Detection
//! ([RFC 5227]).
//!
//! The crate provides the conflict-detection state machine and abstractions
//! for its platform dependencies: a monotonic clock, one-shot timers, a
//! random number generator, client event delivery, and the filtered raw ARP
//! socket. Bindings implement the traits in [`context`] and [`socket`] on
//! their event loop and drive an [`Ipv4Acd`] by dispatching fired timers
//! into its [`TimerHandler`](context::TimerHandler) implementation and
//! socket readiness into [`Ipv4Acd::handle_socket_readable`].
//!
//! Outcomes are reported as [`AcdEvent`]s through
//! [`EventContext`](context::EventContext), synchronously from within the
//! handler that produced them. The detector is mutably borrowed for the
//! duration of every handler, so a client cannot tear it down from inside
//! event delivery; it reacts once the handler returns.
//!
//! [RFC 5227]: https://datatracker.ietf.org/doc/html/rfc5227

/// The RFC 5227 timing parameters and the conflict-detection state machine.
pub mod acd;

/// The ARP frame layout, the probe/announcement constructors, and the
/// conflict classifier.
pub mod arp;

/// Execution-context traits binding the state machine to a platform event
/// loop, and fakes for testing against them.
pub mod context;

/// Abstractions for the filtered raw ARP socket.
pub mod socket;

/// Types for dealing with time.
pub mod time;

pub use acd::{AcdBindingsContext, AcdEvent, AcdTimerId, BusyError, Ipv4Acd, StartError};
