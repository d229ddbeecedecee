use rand::RngCore;

use crate::types::PeerId;

// Client identifier followed by a version digit, the rest is random.
const PEER_ID_PREFIX: &[u8] = b"-TT00";

/// Generates a peer ID drawing its random suffix from `rng`.
pub fn generate_peer_id<R: RngCore + ?Sized>(rng: &mut R) -> PeerId {
    let mut peer_id: PeerId = [0; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    rng.fill_bytes(&mut peer_id[PEER_ID_PREFIX.len()..]);
    peer_id
}

pub fn random_peer_id() -> PeerId {
    generate_peer_id(&mut rand::rng())
}
