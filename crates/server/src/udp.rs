//! Non-blocking UDP sockets for datapath agents and control-plane clients.

use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
};

use common::{
    ControllerCommand, DatapathEvent, Dpid, ServerMessage, decode_frame, encode_frame,
    encode_message,
    southbound::{PortConfig, StatsRequest},
};
use tracing::debug;

use crate::{
    error::{ControllerResult, TransportError},
    transport::Transport,
};

/// Southbound socket: postcard frames to and from datapath agents.
pub struct DatapathSocket {
    socket: UdpSocket,
    agents: HashMap<Dpid, SocketAddr>,
}

impl DatapathSocket {
    pub fn bind(addr: SocketAddr) -> ControllerResult<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(DatapathSocket {
            socket,
            agents: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> ControllerResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Remember where a switch's agent lives.
    pub fn register(&mut self, dpid: Dpid, addr: SocketAddr) {
        if self.agents.insert(dpid, addr) != Some(addr) {
            debug!(dpid = %dpid, agent = %addr, "Registered datapath agent");
        }
    }

    pub fn forget(&mut self, dpid: Dpid) {
        self.agents.remove(&dpid);
    }

    pub fn agent(&self, dpid: Dpid) -> Option<SocketAddr> {
        self.agents.get(&dpid).copied()
    }

    /// Next event, or `None` when nothing is waiting.
    pub fn recv_event(&self, buf: &mut [u8]) -> ControllerResult<Option<(DatapathEvent, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, src)) => Ok(Some((decode_frame(&buf[..len])?, src))),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn send(&self, command: ControllerCommand) -> Result<(), TransportError> {
        let dpid = command.dpid();
        let addr = self
            .agent(dpid)
            .ok_or(TransportError::UnknownDatapath(dpid))?;
        let frame =
            encode_frame(&command).map_err(|source| TransportError::Encode { dpid, source })?;
        self.socket
            .send_to(&frame, addr)
            .map_err(|source| TransportError::Io { dpid, addr, source })?;
        Ok(())
    }
}

impl Transport for DatapathSocket {
    fn send_stats_request(&mut self, request: StatsRequest) -> Result<(), TransportError> {
        self.send(ControllerCommand::StatsRequest(request))
    }

    fn send_port_config(&mut self, config: PortConfig) -> Result<(), TransportError> {
        self.send(ControllerCommand::PortConfig(config))
    }
}

/// Northbound socket: one JSON message per datagram.
pub struct ClientSocket {
    socket: UdpSocket,
}

impl ClientSocket {
    pub fn bind(addr: SocketAddr) -> ControllerResult<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(ClientSocket { socket })
    }

    pub fn local_addr(&self) -> ControllerResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn recv(&self, buf: &mut [u8]) -> ControllerResult<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn send(&self, addr: SocketAddr, message: &ServerMessage) -> ControllerResult<()> {
        let bytes = encode_message(message)?;
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }
}
