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

//! Single-threaded socket reactor ([`Reactor`]) multiplexing listeners,
//! stream connections and watched file descriptors over an epoll readiness
//! poller. Each connection is a small state machine covering accept, TLS
//! handshakes (direct and STARTTLS), half-duplex close and rate-limited
//! reads; a deadline-ordered timer heap drives idle timeouts and pauses and
//! bounds the poll wait.
//!
//! Everything runs on the calling thread. Callbacks ([`Listeners`]) execute
//! to completion between poll waits; no two of them ever run concurrently.
//! Long-running work inside a callback stalls the whole reactor.

#[macro_use]
extern crate amplify;

pub mod compat;
pub mod config;
mod conn;
pub mod notify;
pub mod poller;
mod reactor;
mod timers;
pub mod tls;

pub use compat::{EV_LEAVE, EV_READ, EV_READWRITE, EV_WRITE};
pub use config::Config;
pub use conn::{Conn, Kind, Listeners, WatchFn};
pub use reactor::{ClientOptions, Error, Reactor, ServerOptions};
pub use timers::{to_absolute_time, TimerId};
pub use tls::{TlsContext, TlsSession};
