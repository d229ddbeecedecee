pub type Sha1Hash = [u8; 20];

// Identifies this client to trackers and peers.
// https://www.bittorrent.org/beps/bep_0020.html
pub type PeerId = [u8; 20];
