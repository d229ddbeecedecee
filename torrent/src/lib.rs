//! Protocol core of a BitTorrent client: `.torrent` metadata, HTTP tracker
//! announces, peer wire message framing and piece bitfields.

pub mod bitfield;
pub mod hash;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod peer_id;
pub mod tracker;
pub mod types;

pub use bitfield::Bitfield;
pub use message::{Frame, Message, MessageCodec, MessageError, MessageId};
pub use metainfo::{Info, MetaInfoError, TorrentFile};
pub use peer::Peer;
pub use peer_id::{generate_peer_id, random_peer_id};
pub use tracker::{
    AnnounceResponse, ResponseError, Tracker, TrackerConfig, TrackerError, build_announce_url,
    request_peers,
};
pub use types::{PeerId, Sha1Hash};
