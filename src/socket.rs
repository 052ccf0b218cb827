// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Abstractions for the raw ARP socket the conflict detector listens and
//! transmits on.
//!
//! Opening the socket, attaching the kernel filter, and watching the
//! descriptor for readability are platform concerns; the state machine only
//! sees the two operations below plus `std::io` errors at the seam.

use core::num::NonZeroU64;
use std::io;

use net_types::ethernet::Mac;
use net_types::ip::Ipv4Addr;
use net_types::{SpecifiedAddr, UnicastAddr};

use crate::arp::ArpFrame;

/// A raw link-layer socket carrying ARP traffic for a single candidate
/// address.
pub trait ArpSocket {
    /// Transmits one ARP frame on the bound interface.
    fn send(&mut self, frame: &ArpFrame) -> io::Result<()>;

    /// Receives at most one pending frame into `buf`, returning the received
    /// length.
    ///
    /// Must not block: when no frame is queued, implementations return an
    /// error of kind [`io::ErrorKind::WouldBlock`]. Frames longer than `buf`
    /// are truncated to its length.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A context that provides raw ARP sockets.
pub trait ArpSocketContext {
    /// The socket type produced by this context.
    type Socket: ArpSocket;

    /// Opens a raw ARP socket bound to the interface identified by `ifindex`.
    ///
    /// The socket must deliver only ARP frames whose sender or target
    /// protocol address equals `address` and whose sender hardware address
    /// differs from `mac` (so the host never sees its own transmissions).
    /// The conflict detector relies on this filter: while it has not yet
    /// claimed the address, it treats every delivered frame as evidence that
    /// another host is using or probing for the candidate.
    fn open_raw_arp_socket(
        &mut self,
        ifindex: NonZeroU64,
        address: SpecifiedAddr<Ipv4Addr>,
        mac: UnicastAddr<Mac>,
    ) -> io::Result<Self::Socket>;
}

/// A fake [`ArpSocket`] for use in testing.
#[cfg(any(test, feature = "testutils"))]
pub mod testutil {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    /// State shared between a [`FakeArpSocket`], the context that opened it,
    /// and the test driving them.
    ///
    /// Keeping the state in a shared cell lets tests inspect transmitted
    /// frames after the detector has dropped the socket.
    #[derive(Default)]
    pub struct FakeSocketState {
        /// Frames transmitted through the socket, in order.
        pub sent: Vec<ArpFrame>,
        /// Receive results handed out one per `recv` call. An empty queue
        /// reads as [`io::ErrorKind::WouldBlock`].
        pub rx_queue: VecDeque<io::Result<Vec<u8>>>,
        /// When set, the next `send` fails with this error.
        pub send_error: Option<io::Error>,
        /// When set, the next socket open fails with this error.
        pub open_error: Option<io::Error>,
    }

    /// A fake [`ArpSocket`] recording sends and replaying queued receives.
    pub struct FakeArpSocket {
        state: Rc<RefCell<FakeSocketState>>,
    }

    impl FakeArpSocket {
        /// Creates a fake socket backed by `state`.
        pub fn new(state: Rc<RefCell<FakeSocketState>>) -> FakeArpSocket {
            FakeArpSocket { state }
        }
    }

    impl ArpSocket for FakeArpSocket {
        fn send(&mut self, frame: &ArpFrame) -> io::Result<()> {
            let mut state = self.state.borrow_mut();
            if let Some(e) = state.send_error.take() {
                return Err(e);
            }
            state.sent.push(*frame);
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.state.borrow_mut().rx_queue.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(bytes)) => {
                    let n = buf.len().min(bytes.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
            }
        }
    }
}
