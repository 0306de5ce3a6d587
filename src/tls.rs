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

//! TLS contexts and sessions driven from readiness events.
//!
//! Certificate material, verifiers, SNI-based certificate selection and
//! DANE/TLSA constraints are all baked into the [`rustls`] configs by the
//! embedding application; the reactor only instantiates sessions from them
//! and shuttles records.

use std::fmt::{self, Debug, Formatter};
use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, IoState, ServerConfig, ServerConnection};

/// TLS configuration attached to a listener or connection. A context may
/// carry either or both halves; accepted sockets use the server half,
/// outgoing sockets the client half.
#[derive(Default, Clone)]
pub struct TlsContext {
    pub server: Option<Arc<ServerConfig>>,
    pub client: Option<Arc<ClientConfig>>,
}

impl TlsContext {
    pub fn for_server(cfg: Arc<ServerConfig>) -> Self {
        TlsContext {
            server: Some(cfg),
            client: None,
        }
    }

    pub fn for_client(cfg: Arc<ClientConfig>) -> Self {
        TlsContext {
            server: None,
            client: Some(cfg),
        }
    }

    pub(crate) fn accept(&self) -> Result<TlsSession, String> {
        let cfg = self.server.clone().ok_or("context has no server configuration")?;
        ServerConnection::new(cfg)
            .map(TlsSession::Server)
            .map_err(|err| err.to_string())
    }

    pub(crate) fn connect(&self, name: &str) -> Result<TlsSession, String> {
        let cfg = self.client.clone().ok_or("context has no client configuration")?;
        let name = ServerName::try_from(name.to_owned()).map_err(|err| err.to_string())?;
        ClientConnection::new(cfg, name)
            .map(TlsSession::Client)
            .map_err(|err| err.to_string())
    }
}

impl Debug for TlsContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

/// A live TLS session over a nonblocking socket. Both directions expose the
/// record-layer surface the read/write drivers need.
pub enum TlsSession {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsSession {
    pub fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsSession::Server(conn) => conn.read_tls(rd),
            TlsSession::Client(conn) => conn.read_tls(rd),
        }
    }

    pub fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsSession::Server(conn) => conn.write_tls(wr),
            TlsSession::Client(conn) => conn.write_tls(wr),
        }
    }

    pub fn process_new_packets(&mut self) -> Result<IoState, rustls::Error> {
        match self {
            TlsSession::Server(conn) => conn.process_new_packets(),
            TlsSession::Client(conn) => conn.process_new_packets(),
        }
    }

    pub fn wants_read(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.wants_read(),
            TlsSession::Client(conn) => conn.wants_read(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.wants_write(),
            TlsSession::Client(conn) => conn.wants_write(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.is_handshaking(),
            TlsSession::Client(conn) => conn.is_handshaking(),
        }
    }

    pub fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(conn) => conn.reader(),
            TlsSession::Client(conn) => conn.reader(),
        }
    }

    pub fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(conn) => conn.writer(),
            TlsSession::Client(conn) => conn.writer(),
        }
    }

    /// SNI name presented by the peer; only server sessions learn one.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            TlsSession::Server(conn) => conn.server_name(),
            TlsSession::Client(_) => None,
        }
    }
}
