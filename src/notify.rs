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

//! Startup notification for the surrounding daemon.
//!
//! The daemon announces readiness over a datagram Unix socket (customarily
//! `notify.sock` inside its runtime directory). The reactor neither creates
//! nor parses this socket; the helper only covers the sending side of the
//! boundary.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

/// Sends the `READY=1` datagram to the supervisor listening at `path`.
pub fn notify_ready(path: impl AsRef<Path>) -> io::Result<()> {
    let socket = UnixDatagram::unbound()?;
    socket.send_to(b"READY=1", path)?;
    Ok(())
}
