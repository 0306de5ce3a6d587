// Event-driven socket multiplexer built on the reactor pattern.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Process-wide reactor tunables.

use std::time::Duration;

/// Tunables read by the event loop and the connection state machine.
///
/// Installing a new record via [`crate::Reactor::set_config`] affects timers
/// armed afterwards and connections created afterwards; connections mid-flight
/// keep their current deadlines until the next re-arm.
#[derive(Clone, Debug)]
pub struct Config {
    /// Read silence tolerated before `on_read_timeout` is consulted.
    pub read_timeout: Duration,
    /// Time a connected peer may stall our pending outgoing data.
    pub send_timeout: Duration,
    /// Time budget for an outgoing connection attempt.
    pub connect_timeout: Duration,
    /// Listen backlog for newly bound sockets.
    pub tcp_backlog: i32,
    /// How long a listener pauses itself after a failed accept.
    pub accept_retry_interval: Duration,
    /// Delay before re-reading a socket which still has buffered bytes,
    /// yielding the loop to other descriptors.
    pub read_retry_delay: Duration,
    /// Maximum bytes requested per receive call.
    pub read_size: usize,
    /// Time budget for a TLS handshake, either direction.
    pub ssl_handshake_timeout: Duration,
    /// Upper bound on a single poll wait.
    pub max_wait: Duration,
    /// Lower bound on a single poll wait; also the threshold below which a
    /// rate-limit pause is not worth scheduling.
    pub min_wait: Duration,
    /// Promotes per-chunk traffic logging to debug level.
    pub verbose: bool,
    /// Destroy a connection whose listener callback panicked.
    pub fatal_errors: bool,
    /// Trap panics in listener callbacks instead of unwinding through the
    /// event loop.
    pub protect_listeners: bool,
    /// Attempt a synchronous send from within `write` instead of waiting for
    /// the next writable event.
    pub opportunistic_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            read_timeout: Duration::from_secs(14 * 60),
            send_timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(20),
            tcp_backlog: 128,
            accept_retry_interval: Duration::from_secs(10),
            read_retry_delay: Duration::from_micros(1),
            read_size: 8192,
            ssl_handshake_timeout: Duration::from_secs(60),
            max_wait: Duration::from_secs(86400),
            min_wait: Duration::from_millis(1),
            verbose: false,
            fatal_errors: false,
            protect_listeners: true,
            opportunistic_writes: false,
        }
    }
}
