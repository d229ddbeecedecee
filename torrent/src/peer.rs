use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use bytes::Buf;

use crate::tracker::TrackerError;

// in compact format, each peer is represented by 6 bytes:
// 4 bytes for the IPv4 address and 2 bytes for the port number
// https://www.bittorrent.org/beps/bep_0023.html
const COMPACT_PEER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn parse_compact(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
        if bytes.len() % COMPACT_PEER_LEN != 0 {
            return Err(TrackerError::InvalidPeerList(bytes.len()));
        }
        Ok(bytes
            .chunks_exact(COMPACT_PEER_LEN)
            .map(|mut chunk| {
                let ip = Ipv4Addr::from(chunk.get_u32());
                let port = chunk.get_u16();
                Peer::new(ip, port)
            })
            .collect())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::from(*self))
    }
}

impl From<SocketAddrV4> for Peer {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<Peer> for SocketAddrV4 {
    fn from(peer: Peer) -> Self {
        SocketAddrV4::new(peer.ip, peer.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
