use libp2p_identity::PeerId;
use tendril_primitives::Cid;
use tracing::{debug, warn};

/// A raw root announcement as delivered by the pub/sub transport: the
/// sender's identity and the payload bytes (a link's binary form).
#[derive(Clone, Debug)]
pub struct Announcement {
    pub source: PeerId,
    pub data: Vec<u8>,
}

impl Announcement {
    pub fn new(source: PeerId, data: Vec<u8>) -> Self {
        Self { source, data }
    }
}

/// Translates a raw announcement into `(publisher, link)`.
///
/// Malformed payloads and self-announcements yield `None`: logged and
/// dropped, no event.
pub(crate) fn decode(local_peer: &PeerId, announcement: &Announcement) -> Option<(PeerId, Cid)> {
    if announcement.source == *local_peer {
        debug!(peer = %announcement.source, "dropping own announcement");
        return None;
    }

    match Cid::from_bytes(&announcement.data) {
        Ok(cid) => Some((announcement.source, cid)),
        Err(err) => {
            warn!(peer = %announcement.source, %err, "dropping malformed announcement");
            None
        }
    }
}
