//! In-process media backend
//!
//! [`LoopbackNetwork`] pairs [`PeerLink`]s created by any number of
//! [`LoopbackEngine`]s in the same process. Descriptions carry the link id
//! and its announced tracks, so once both sides of a negotiation have
//! applied their local and remote descriptions the network marks them
//! connected and delivers each side the other's tracks.
//!
//! Used by the CLI demo and the test suite; knobs on the network simulate
//! stalled path discovery, unreachable paths and interrupted links.

use crate::config::{IceServer, MediaConstraints};
use crate::identity::SessionId;
use crate::media::{LocalMedia, LocalTrack, MediaDevices, MediaError, RemoteTrack};
use crate::transport::{LinkEvent, LinkEventSink, LinkState, MediaEngine, PeerLink, TransportError};
use crate::types::{IceCandidate, MediaKind, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const LINK_ATTR: &str = "a=x-loopback-link:";
const TRACK_ATTR: &str = "a=x-loopback-track:";

#[derive(Debug)]
struct LinkEntry {
    owner: SessionId,
    sink: LinkEventSink,
    tracks: Vec<RemoteTrack>,
    local_set: bool,
    remote: Option<u64>,
    remote_offer: bool,
    candidates_received: usize,
    connected: bool,
    interrupted: bool,
    closed: bool,
}

impl LinkEntry {
    fn between(&self, a: &SessionId, b: &SessionId) -> bool {
        (&self.owner == a && self.sink.peer() == b) || (&self.owner == b && self.sink.peer() == a)
    }
}

#[derive(Debug, Default)]
struct Network {
    next_link: u64,
    links: HashMap<u64, LinkEntry>,
    stall_gathering: bool,
    stall_connections: bool,
}

impl Network {
    fn entry(&mut self, id: u64) -> Result<&mut LinkEntry, TransportError> {
        match self.links.get_mut(&id) {
            Some(entry) if !entry.closed => Ok(entry),
            _ => Err(TransportError::Closed),
        }
    }

    fn try_connect(&mut self, id: u64) {
        if self.stall_connections {
            return;
        }
        let (remote_id, local_tracks) = match self.links.get(&id) {
            Some(e) if !e.closed && !e.connected && e.local_set => match e.remote {
                Some(remote_id) => (remote_id, e.tracks.clone()),
                None => return,
            },
            _ => return,
        };
        let remote_tracks = match self.links.get(&remote_id) {
            Some(r) if !r.closed && r.local_set && r.remote == Some(id) => r.tracks.clone(),
            _ => return,
        };

        for (link, tracks) in [(id, remote_tracks), (remote_id, local_tracks)] {
            if let Some(entry) = self.links.get_mut(&link) {
                entry.connected = true;
                entry.sink.emit(LinkEvent::StateChanged(LinkState::Connecting));
                entry.sink.emit(LinkEvent::StateChanged(LinkState::Connected));
                for track in tracks {
                    entry.sink.emit(LinkEvent::RemoteTrack(track));
                }
            }
        }
        tracing::debug!(link = id, remote = remote_id, "Loopback links paired");
    }
}

/// Shared in-process network
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Network>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Media engine for the client `owner`
    pub fn engine(&self, owner: SessionId) -> LoopbackEngine {
        LoopbackEngine {
            network: self.clone(),
            owner,
        }
    }

    /// Stop emitting local candidates and gathering completion
    pub fn stall_gathering(&self, stall: bool) {
        self.inner.lock().stall_gathering = stall;
    }

    /// Never pair links, so negotiations complete but never connect
    pub fn stall_connections(&self, stall: bool) {
        self.inner.lock().stall_connections = stall;
    }

    /// Drop the path between `a` and `b`; both links report `Disconnected`
    pub fn interrupt(&self, a: &SessionId, b: &SessionId) {
        let mut net = self.inner.lock();
        for entry in net.links.values_mut() {
            if entry.between(a, b) && entry.connected && !entry.closed && !entry.interrupted {
                entry.interrupted = true;
                entry.sink.emit(LinkEvent::StateChanged(LinkState::Disconnected));
            }
        }
    }

    /// Restore an interrupted path; both links report `Connected` again
    pub fn restore(&self, a: &SessionId, b: &SessionId) {
        let mut net = self.inner.lock();
        for entry in net.links.values_mut() {
            if entry.between(a, b) && entry.interrupted && !entry.closed {
                entry.interrupted = false;
                entry.sink.emit(LinkEvent::StateChanged(LinkState::Connected));
            }
        }
    }

    /// Permanently break the path between `a` and `b`
    pub fn sever(&self, a: &SessionId, b: &SessionId) {
        let mut net = self.inner.lock();
        for entry in net.links.values_mut() {
            if entry.between(a, b) && !entry.closed {
                entry.connected = false;
                entry.sink.emit(LinkEvent::StateChanged(LinkState::Failed));
            }
        }
    }

    /// Links not yet closed
    pub fn open_links(&self) -> usize {
        self.inner.lock().links.values().filter(|e| !e.closed).count()
    }

    /// Open links owned by `owner`
    pub fn open_links_of(&self, owner: &SessionId) -> usize {
        self.inner
            .lock()
            .links
            .values()
            .filter(|e| !e.closed && &e.owner == owner)
            .count()
    }

    /// Remote candidates `owner`'s link towards `peer` has been given
    pub fn candidates_received(&self, owner: &SessionId, peer: &SessionId) -> usize {
        self.inner
            .lock()
            .links
            .values()
            .filter(|e| &e.owner == owner && e.sink.peer() == peer)
            .map(|e| e.candidates_received)
            .sum()
    }
}

/// Per-client handle onto a [`LoopbackNetwork`]
#[derive(Debug, Clone)]
pub struct LoopbackEngine {
    network: LoopbackNetwork,
    owner: SessionId,
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_link(
        &self,
        ice_servers: &[IceServer],
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        let mut net = self.network.inner.lock();
        net.next_link += 1;
        let id = net.next_link;
        tracing::trace!(
            link = id,
            owner = %self.owner,
            peer = %events.peer(),
            ice_servers = ice_servers.len(),
            "Loopback link created"
        );
        net.links.insert(
            id,
            LinkEntry {
                owner: self.owner.clone(),
                sink: events,
                tracks: Vec::new(),
                local_set: false,
                remote: None,
                remote_offer: false,
                candidates_received: 0,
                connected: false,
                interrupted: false,
                closed: false,
            },
        );
        Ok(Box::new(LoopbackLink {
            id,
            network: self.network.clone(),
        }))
    }
}

struct LoopbackLink {
    id: u64,
    network: LoopbackNetwork,
}

impl LoopbackLink {
    fn render(&self, kind: SdpKind, tracks: &[RemoteTrack]) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {id} 1 IN IP4 127.0.0.1\r\ns=-\r\n{LINK_ATTR}{id}\r\n",
            id = self.id
        );
        for track in tracks {
            let kind = match track.kind {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            };
            sdp.push_str(&format!("{TRACK_ATTR}{kind} {} {}\r\n", track.stream_id, track.id));
        }
        SessionDescription { kind, sdp }
    }
}

fn parse_link_id(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(LINK_ATTR))
        .and_then(|id| id.parse().ok())
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), TransportError> {
        let mut net = self.network.inner.lock();
        net.entry(self.id)?.tracks.push(RemoteTrack {
            id: track.id.clone(),
            kind: track.kind,
            stream_id: stream_id.to_string(),
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut net = self.network.inner.lock();
        let tracks = net.entry(self.id)?.tracks.clone();
        Ok(self.render(SdpKind::Offer, &tracks))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut net = self.network.inner.lock();
        let entry = net.entry(self.id)?;
        if !entry.remote_offer {
            return Err(TransportError::Negotiation(
                "no remote offer to answer".to_string(),
            ));
        }
        let tracks = entry.tracks.clone();
        Ok(self.render(SdpKind::Answer, &tracks))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if parse_link_id(&desc.sdp) != Some(self.id) {
            return Err(TransportError::Negotiation(
                "local description was not produced by this link".to_string(),
            ));
        }
        let mut net = self.network.inner.lock();
        let stall = net.stall_gathering;
        let entry = net.entry(self.id)?;
        entry.local_set = true;
        if !stall {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{id} 1 udp 2122260223 127.0.0.1 {port} typ host",
                    id = self.id,
                    port = 40_000 + self.id
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            };
            entry.sink.emit(LinkEvent::LocalCandidate(candidate));
            entry.sink.emit(LinkEvent::GatheringComplete);
        }
        net.try_connect(self.id);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = parse_link_id(&desc.sdp).ok_or_else(|| {
            TransportError::Negotiation("not a loopback description".to_string())
        })?;
        let mut net = self.network.inner.lock();
        let entry = net.entry(self.id)?;
        entry.remote = Some(remote);
        entry.remote_offer = desc.kind == SdpKind::Offer;
        net.try_connect(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        let mut net = self.network.inner.lock();
        net.entry(self.id)?.candidates_received += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut net = self.network.inner.lock();
        if let Some(entry) = net.links.get_mut(&self.id) {
            entry.closed = true;
            entry.connected = false;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DevicesState {
    deny: AtomicBool,
    captures: Mutex<Vec<LocalMedia>>,
}

/// Fake capture devices producing synthetic tracks
#[derive(Debug, Clone, Default)]
pub struct LoopbackDevices {
    state: Arc<DevicesState>,
}

impl LoopbackDevices {
    /// Devices that grant every request
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or grant again) capture permission
    pub fn deny(&self, deny: bool) {
        self.state.deny.store(deny, Ordering::SeqCst);
    }

    /// Number of successful acquisitions
    pub fn captures(&self) -> usize {
        self.state.captures.lock().len()
    }

    /// Acquisitions whose media has not been stopped
    pub fn live_captures(&self) -> usize {
        self.state
            .captures
            .lock()
            .iter()
            .filter(|m| !m.is_stopped())
            .count()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        if self.state.deny.load(Ordering::SeqCst) {
            return Err(MediaError::Denied("capture permission denied".to_string()));
        }
        if !constraints.has_audio() && !constraints.has_video() {
            return Err(MediaError::NoDevice("no audio or video requested".to_string()));
        }

        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(LocalTrack::new(MediaKind::Audio, "Loopback Microphone"));
        }
        if constraints.has_video() {
            tracks.push(LocalTrack::new(MediaKind::Video, "Loopback Camera"));
        }
        let media = LocalMedia::new(tracks);
        self.state.captures.lock().push(media.clone());
        Ok(media)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denied_capture() {
        let devices = LoopbackDevices::new();
        devices.deny(true);
        let res = devices.acquire(&MediaConstraints::audio_only()).await;
        assert!(matches!(res, Err(MediaError::Denied(_))));
        assert_eq!(devices.captures(), 0);
    }

    #[tokio::test]
    async fn test_empty_constraints_have_no_device() {
        let devices = LoopbackDevices::new();
        let constraints = MediaConstraints {
            audio: None,
            video: false,
        };
        assert!(matches!(
            devices.acquire(&constraints).await,
            Err(MediaError::NoDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_live_captures_follow_stop() {
        let devices = LoopbackDevices::new();
        let media = devices.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert_eq!(media.tracks().len(), 2);
        assert_eq!(devices.live_captures(), 1);
        media.stop();
        assert_eq!(devices.live_captures(), 0);
        assert_eq!(devices.captures(), 1);
    }

    #[test]
    fn test_parse_link_id() {
        assert_eq!(parse_link_id("v=0\r\na=x-loopback-link:42\r\n"), Some(42));
        assert_eq!(parse_link_id("v=0\r\n"), None);
    }

    #[tokio::test]
    async fn test_foreign_description_is_rejected() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let engine = network.engine(SessionId::new("a"));
        let sink = LinkEventSink::new(
            crate::transport::TransportId::new(),
            SessionId::new("b"),
            tx,
        );
        let link = engine.create_link(&[], sink).await.unwrap();
        let res = link
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await;
        assert!(matches!(res, Err(TransportError::Negotiation(_))));

        link.close().await.unwrap();
        assert_eq!(network.open_links(), 0);
        assert!(matches!(link.create_offer().await, Err(TransportError::Closed)));
    }
}
