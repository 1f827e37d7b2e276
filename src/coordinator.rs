use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaCapture};
use crate::peer::{MeshPeer, PeerEvent, PeerFactory, RemoteStream};
use crate::signaling::{SignalingClient, SignalingMessage};

/// Coordinator lifecycle. Terminal transitions collapse back to `Idle`;
/// a coordinator is reusable only by calling `start` again from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    Idle,
    AcquiringMedia,
    Joining,
    Active,
    Leaving,
}

/// One remote participant as exposed to the view layer, in arrival order.
/// `stream` is `None` while negotiation is still in flight.
#[derive(Clone)]
pub struct RemotePeer {
    pub peer_id: String,
    pub stream: Option<RemoteStream>,
}

struct PeerLink {
    peer_id: String,
    initiator: bool,
    peer: Arc<dyn MeshPeer>,
    stream: Option<RemoteStream>,
}

enum Command {
    SetAudio(bool),
    SetVideo(bool),
    Stop(oneshot::Sender<()>),
}

enum Input {
    Command(Option<Command>),
    Peer(PeerEvent),
    Signal(Option<SignalingMessage>),
}

/// Joins a named room, negotiates one connection per other participant,
/// and exposes the resulting remote streams.
///
/// All state lives on this struct and is mutated only from `start`, the
/// message handlers, and `stop`; the actor loop in [`run`] serializes them.
///
/// [`run`]: MeshCoordinator::spawn
pub struct MeshCoordinator {
    state: MeshState,
    room_id: Option<String>,
    local_peer_id: String,
    signaling: SignalingClient,
    capture: Arc<dyn MediaCapture>,
    factory: Arc<dyn PeerFactory>,
    local: Option<LocalStream>,
    links: Vec<PeerLink>,
    remote_tx: watch::Sender<Vec<RemotePeer>>,
    remote_rx: watch::Receiver<Vec<RemotePeer>>,
    peer_tx: mpsc::Sender<PeerEvent>,
    peer_rx: mpsc::Receiver<PeerEvent>,
}

impl MeshCoordinator {
    pub fn new(
        signaling: SignalingClient,
        capture: Arc<dyn MediaCapture>,
        factory: Arc<dyn PeerFactory>,
        config: &MeshConfig,
    ) -> Self {
        let (remote_tx, remote_rx) = watch::channel(Vec::new());
        let (peer_tx, peer_rx) = mpsc::channel(64);
        Self {
            state: MeshState::Idle,
            room_id: None,
            local_peer_id: config.local_peer_id(),
            signaling,
            capture,
            factory,
            local: None,
            links: Vec::new(),
            remote_tx,
            remote_rx,
            peer_tx,
            peer_rx,
        }
    }

    pub fn state(&self) -> MeshState {
        self.state
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Shared local stream; `Some` from a successful `start` until `stop`.
    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    /// Live ordered collection of remote participants for rendering.
    pub fn remote_peers(&self) -> watch::Receiver<Vec<RemotePeer>> {
        self.remote_rx.clone()
    }

    /// Current links as (peer id, initiator) pairs, in arrival order.
    pub fn links(&self) -> Vec<(String, bool)> {
        self.links
            .iter()
            .map(|l| (l.peer_id.clone(), l.initiator))
            .collect()
    }

    /// Acquires local media and announces presence in `room_id`.
    ///
    /// Media acquisition failure is fatal for this attempt: the coordinator
    /// returns to `Idle` without ever touching the signaling channel, and
    /// the caller may retry. Joining is fire-and-forget; the coordinator is
    /// `Active` as soon as the announcement is sent, without waiting for a
    /// roster.
    pub async fn start(&mut self, room_id: &str) -> Result<()> {
        if self.state != MeshState::Idle {
            return Err(Error::State(format!(
                "cannot start while {:?}",
                self.state
            )));
        }

        self.state = MeshState::AcquiringMedia;
        match self.capture.acquire().await {
            Ok(stream) => self.local = Some(stream),
            Err(e) => {
                self.state = MeshState::Idle;
                return Err(e);
            }
        }

        self.state = MeshState::Joining;
        self.room_id = Some(room_id.to_string());
        let join = SignalingMessage::Join {
            room_id: room_id.to_string(),
            peer_id: self.local_peer_id.clone(),
        };
        if let Err(e) = self.signaling.send(join).await {
            if let Some(local) = self.local.take() {
                local.stop();
            }
            self.room_id = None;
            self.state = MeshState::Idle;
            return Err(e);
        }

        self.state = MeshState::Active;
        info!("joined room {} as {}", room_id, self.local_peer_id);
        Ok(())
    }

    /// Gates the shared audio track; peers simply stop receiving samples.
    pub fn set_local_audio_enabled(&self, enabled: bool) {
        if let Some(local) = &self.local {
            local.set_audio_enabled(enabled);
        }
    }

    /// Gates the shared video track.
    pub fn set_local_video_enabled(&self, enabled: bool) {
        if let Some(local) = &self.local {
            local.set_video_enabled(enabled);
        }
    }

    /// Stops local capture, closes every link, and clears the exposed
    /// remote set. Awaitable and idempotent; calling from `Idle` is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == MeshState::Idle {
            return Ok(());
        }
        self.state = MeshState::Leaving;

        if let Some(local) = self.local.take() {
            local.stop();
        }
        for link in self.links.drain(..) {
            if let Err(e) = link.peer.close().await {
                debug!("closing connection to {}: {}", link.peer_id, e);
            }
        }
        self.publish();

        if let Some(room_id) = self.room_id.take() {
            info!("left room {}", room_id);
        }
        self.state = MeshState::Idle;
        Ok(())
    }

    /// Applies one inbound signaling event.
    ///
    /// Per-peer failures are contained here: a participant whose connection
    /// cannot be opened or negotiated is dropped without disturbing the
    /// others. Only signaling-transport failures propagate.
    pub async fn handle_message(&mut self, msg: SignalingMessage) -> Result<()> {
        match msg {
            SignalingMessage::Roster { peers } => {
                for peer_id in peers {
                    if peer_id == self.local_peer_id || self.find_link(&peer_id).is_some() {
                        continue;
                    }
                    self.dial(&peer_id).await?;
                }
            }
            SignalingMessage::Offer { from_peer, sdp, .. } => {
                if self.find_link(&from_peer).is_some() {
                    debug!("dropping duplicate offer from {}", from_peer);
                    return Ok(());
                }
                let peer = match self.open_link(&from_peer, false).await {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("failed to open connection for {}: {}", from_peer, e);
                        return Ok(());
                    }
                };
                match peer.accept_offer(&sdp).await {
                    Ok(answer) => {
                        let msg = SignalingMessage::Answer {
                            room_id: self.room_id.clone().unwrap_or_default(),
                            sdp: answer,
                            from_peer: self.local_peer_id.clone(),
                            to_peer: from_peer,
                        };
                        self.signaling.send(msg).await?;
                    }
                    Err(e) => {
                        warn!("negotiation with {} failed: {}", from_peer, e);
                        self.remove_link(&from_peer).await;
                    }
                }
            }
            SignalingMessage::Answer { from_peer, sdp, .. } => {
                match self.find_link(&from_peer).map(|l| l.peer.clone()) {
                    Some(peer) => {
                        if let Err(e) = peer.accept_answer(&sdp).await {
                            warn!("applying answer from {} failed: {}", from_peer, e);
                            self.remove_link(&from_peer).await;
                        }
                    }
                    // Out-of-order or duplicate; not fatal.
                    None => debug!("dropping answer from unknown peer {}", from_peer),
                }
            }
            SignalingMessage::PeerLeft { peer_id } => {
                self.remove_link(&peer_id).await;
            }
            other => debug!("ignoring unexpected signaling message: {:?}", other),
        }
        Ok(())
    }

    /// Hands the coordinator to a spawned actor task, returning a handle
    /// for caller commands. Call after a successful [`start`].
    ///
    /// [`start`]: MeshCoordinator::start
    pub fn spawn(self) -> (RoomHandle, JoinHandle<Result<()>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let handle = RoomHandle {
            cmd_tx,
            remote_rx: self.remote_rx.clone(),
            local: self.local.clone(),
            peer_id: self.local_peer_id.clone(),
        };
        let task = tokio::spawn(self.run(cmd_rx));
        (handle, task)
    }

    /// Actor loop: drains caller commands, peer callbacks, and signaling
    /// events through one `select!`, so every state mutation is serialized.
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) -> Result<()> {
        loop {
            let input = tokio::select! {
                cmd = cmd_rx.recv() => Input::Command(cmd),
                Some(event) = self.peer_rx.recv() => Input::Peer(event),
                msg = self.signaling.recv() => Input::Signal(msg),
            };
            match input {
                Input::Command(Some(Command::SetAudio(enabled))) => {
                    self.set_local_audio_enabled(enabled);
                }
                Input::Command(Some(Command::SetVideo(enabled))) => {
                    self.set_local_video_enabled(enabled);
                }
                Input::Command(Some(Command::Stop(ack))) => {
                    let result = self.stop().await;
                    let _ = ack.send(());
                    return result;
                }
                // Every handle dropped; tear down.
                Input::Command(None) => return self.stop().await,
                Input::Peer(event) => self.handle_peer_event(event).await,
                Input::Signal(Some(msg)) => {
                    if let Err(e) = self.handle_message(msg).await {
                        self.stop().await.ok();
                        return Err(e);
                    }
                }
                Input::Signal(None) => {
                    self.stop().await.ok();
                    return Err(Error::Signaling("signaling channel closed".to_string()));
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Track { peer_id, stream } => {
                if let Some(link) = self.links.iter_mut().find(|l| l.peer_id == peer_id) {
                    link.stream = Some(stream);
                    self.publish();
                } else {
                    debug!("track from unknown peer {}", peer_id);
                }
            }
            PeerEvent::Failed { peer_id } => {
                warn!("connection to {} failed, dropping", peer_id);
                self.remove_link(&peer_id).await;
            }
        }
    }

    /// Initiates negotiation with a participant listed in the roster.
    async fn dial(&mut self, peer_id: &str) -> Result<()> {
        let peer = match self.open_link(peer_id, true).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("failed to open connection for {}: {}", peer_id, e);
                return Ok(());
            }
        };
        match peer.create_offer().await {
            Ok(sdp) => {
                let msg = SignalingMessage::Offer {
                    room_id: self.room_id.clone().unwrap_or_default(),
                    sdp,
                    from_peer: self.local_peer_id.clone(),
                    to_peer: peer_id.to_string(),
                };
                self.signaling.send(msg).await?;
            }
            Err(e) => {
                warn!("offer for {} failed: {}", peer_id, e);
                self.remove_link(peer_id).await;
            }
        }
        Ok(())
    }

    async fn open_link(&mut self, peer_id: &str, initiator: bool) -> Result<Arc<dyn MeshPeer>> {
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| Error::State("no local stream".to_string()))?;
        let peer = self
            .factory
            .open(peer_id, local, self.peer_tx.clone())
            .await?;
        self.links.push(PeerLink {
            peer_id: peer_id.to_string(),
            initiator,
            peer: peer.clone(),
            stream: None,
        });
        self.publish();
        debug!("opened link to {} (initiator: {})", peer_id, initiator);
        Ok(peer)
    }

    /// Removes and closes the link for `peer_id`, if present. Idempotent.
    async fn remove_link(&mut self, peer_id: &str) {
        if let Some(pos) = self.links.iter().position(|l| l.peer_id == peer_id) {
            let link = self.links.remove(pos);
            if let Err(e) = link.peer.close().await {
                debug!("closing connection to {}: {}", peer_id, e);
            }
            self.publish();
        }
    }

    fn find_link(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.iter().find(|l| l.peer_id == peer_id)
    }

    fn publish(&self) {
        let snapshot = self
            .links
            .iter()
            .map(|l| RemotePeer {
                peer_id: l.peer_id.clone(),
                stream: l.stream.clone(),
            })
            .collect();
        self.remote_tx.send_replace(snapshot);
    }
}

/// Clonable command surface for a spawned coordinator.
#[derive(Clone)]
pub struct RoomHandle {
    cmd_tx: mpsc::Sender<Command>,
    remote_rx: watch::Receiver<Vec<RemotePeer>>,
    local: Option<LocalStream>,
    peer_id: String,
}

impl RoomHandle {
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.cmd_tx
            .send(Command::SetAudio(enabled))
            .await
            .map_err(|_| Error::State("session ended".to_string()))
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.cmd_tx
            .send(Command::SetVideo(enabled))
            .await
            .map_err(|_| Error::State("session ended".to_string()))
    }

    /// Leaves the room; resolves once every connection is closed and local
    /// capture is stopped. Safe to call on an already-ended session.
    pub async fn stop(self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(ack_tx)).await.is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }

    pub fn remote_peers(&self) -> watch::Receiver<Vec<RemotePeer>> {
        self.remote_rx.clone()
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NullCapture;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakePeer {
        offers_created: AtomicUsize,
        answers_applied: AtomicUsize,
        closed: AtomicUsize,
        fail_offer: bool,
    }

    impl FakePeer {
        fn new(fail_offer: bool) -> Self {
            Self {
                offers_created: AtomicUsize::new(0),
                answers_applied: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                fail_offer,
            }
        }
    }

    #[async_trait]
    impl MeshPeer for FakePeer {
        async fn create_offer(&self) -> Result<String> {
            if self.fail_offer {
                return Err(Error::Peer("offer failed".to_string()));
            }
            self.offers_created.fetch_add(1, Ordering::SeqCst);
            Ok("offer-sdp".to_string())
        }

        async fn accept_offer(&self, _sdp: &str) -> Result<String> {
            Ok("answer-sdp".to_string())
        }

        async fn accept_answer(&self, _sdp: &str) -> Result<()> {
            self.answers_applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        peers: Mutex<HashMap<String, Arc<FakePeer>>>,
        fail_open_for: Option<String>,
        fail_offer_for: Option<String>,
    }

    impl FakeFactory {
        fn peer(&self, peer_id: &str) -> Arc<FakePeer> {
            self.peers.lock().unwrap().get(peer_id).unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn open(
            &self,
            peer_id: &str,
            _local: &LocalStream,
            _events: mpsc::Sender<PeerEvent>,
        ) -> Result<Arc<dyn MeshPeer>> {
            if self.fail_open_for.as_deref() == Some(peer_id) {
                return Err(Error::Peer("open failed".to_string()));
            }
            let fail_offer = self.fail_offer_for.as_deref() == Some(peer_id);
            let peer = Arc::new(FakePeer::new(fail_offer));
            self.peers
                .lock()
                .unwrap()
                .insert(peer_id.to_string(), peer.clone());
            Ok(peer)
        }
    }

    struct FailingCapture;

    #[async_trait]
    impl crate::media::MediaCapture for FailingCapture {
        async fn acquire(&self) -> Result<LocalStream> {
            Err(Error::Media("permission denied".to_string()))
        }
    }

    struct Harness {
        coordinator: MeshCoordinator,
        outbound: mpsc::Receiver<SignalingMessage>,
        inbound: mpsc::Sender<SignalingMessage>,
        factory: Arc<FakeFactory>,
    }

    fn harness_with(factory: FakeFactory, capture: Arc<dyn MediaCapture>) -> Harness {
        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(32);
        let signaling = SignalingClient::from_parts(out_tx, in_rx);
        let factory = Arc::new(factory);
        let config = MeshConfig {
            peer_id: Some("C".to_string()),
            ..Default::default()
        };
        let coordinator = MeshCoordinator::new(signaling, capture, factory.clone(), &config);
        Harness {
            coordinator,
            outbound: out_rx,
            inbound: in_tx,
            factory,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeFactory::default(), Arc::new(NullCapture))
    }

    fn roster(peers: &[&str]) -> SignalingMessage {
        SignalingMessage::Roster {
            peers: peers.iter().map(|p| p.to_string()).collect(),
        }
    }

    async fn expect_join(h: &mut Harness) {
        match h.outbound.recv().await {
            Some(SignalingMessage::Join { room_id, peer_id }) => {
                assert_eq!(room_id, "book-club-42");
                assert_eq!(peer_id, "C");
            }
            other => panic!("expected join, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_announces_and_activates() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        assert_eq!(h.coordinator.state(), MeshState::Active);
        assert!(h.coordinator.local_stream().is_some());
        expect_join(&mut h).await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        let err = h.coordinator.start("book-club-42").await.unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert_eq!(h.coordinator.state(), MeshState::Active);
    }

    #[tokio::test]
    async fn media_failure_is_fatal_and_silent() {
        let mut h = harness_with(FakeFactory::default(), Arc::new(FailingCapture));
        let err = h.coordinator.start("book-club-42").await.unwrap_err();
        assert!(matches!(err, Error::Media(_)));
        assert_eq!(h.coordinator.state(), MeshState::Idle);
        // No join may ever reach the wire.
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn roster_dials_every_listed_participant() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        expect_join(&mut h).await;

        h.coordinator
            .handle_message(roster(&["A", "B"]))
            .await
            .unwrap();
        assert_eq!(
            h.coordinator.links(),
            vec![("A".to_string(), true), ("B".to_string(), true)]
        );

        for expected in ["A", "B"] {
            match h.outbound.recv().await {
                Some(SignalingMessage::Offer {
                    from_peer, to_peer, ..
                }) => {
                    assert_eq!(from_peer, "C");
                    assert_eq!(to_peer, expected);
                }
                other => panic!("expected offer to {}, got {:?}", expected, other),
            }
        }
    }

    #[tokio::test]
    async fn roster_skips_self_and_existing_links() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        h.coordinator.handle_message(roster(&["A"])).await.unwrap();
        h.coordinator
            .handle_message(roster(&["A", "C"]))
            .await
            .unwrap();
        assert_eq!(h.coordinator.links(), vec![("A".to_string(), true)]);
    }

    #[tokio::test]
    async fn offer_from_new_participant_is_answered() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        expect_join(&mut h).await;

        h.coordinator
            .handle_message(SignalingMessage::Offer {
                room_id: "book-club-42".to_string(),
                sdp: "offer-sdp".to_string(),
                from_peer: "D".to_string(),
                to_peer: "C".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(h.coordinator.links(), vec![("D".to_string(), false)]);
        match h.outbound.recv().await {
            Some(SignalingMessage::Answer {
                from_peer,
                to_peer,
                sdp,
                ..
            }) => {
                assert_eq!(from_peer, "C");
                assert_eq!(to_peer, "D");
                assert_eq!(sdp, "answer-sdp");
            }
            other => panic!("expected answer to D, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_offer_is_dropped() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        expect_join(&mut h).await;
        h.coordinator.handle_message(roster(&["A"])).await.unwrap();
        let _ = h.outbound.recv().await; // the offer to A

        h.coordinator
            .handle_message(SignalingMessage::Offer {
                room_id: "book-club-42".to_string(),
                sdp: "offer-sdp".to_string(),
                from_peer: "A".to_string(),
                to_peer: "C".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(h.coordinator.links(), vec![("A".to_string(), true)]);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn answer_from_unknown_peer_is_a_noop() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        expect_join(&mut h).await;

        h.coordinator
            .handle_message(SignalingMessage::Answer {
                room_id: "book-club-42".to_string(),
                sdp: "answer-sdp".to_string(),
                from_peer: "Z".to_string(),
                to_peer: "C".to_string(),
            })
            .await
            .unwrap();

        assert!(h.coordinator.links().is_empty());
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn answer_completes_negotiation_with_known_peer() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        h.coordinator.handle_message(roster(&["A"])).await.unwrap();

        h.coordinator
            .handle_message(SignalingMessage::Answer {
                room_id: "book-club-42".to_string(),
                sdp: "answer-sdp".to_string(),
                from_peer: "A".to_string(),
                to_peer: "C".to_string(),
            })
            .await
            .unwrap();

        let peer = h.factory.peer("A");
        assert_eq!(peer.answers_applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_left_releases_exactly_once() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        h.coordinator
            .handle_message(roster(&["A", "B"]))
            .await
            .unwrap();

        h.coordinator
            .handle_message(SignalingMessage::PeerLeft {
                peer_id: "A".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(h.coordinator.links(), vec![("B".to_string(), true)]);
        assert_eq!(h.factory.peer("A").closed.load(Ordering::SeqCst), 1);

        // Repeated departure is a no-op.
        h.coordinator
            .handle_message(SignalingMessage::PeerLeft {
                peer_id: "A".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(h.factory.peer("A").closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.links(), vec![("B".to_string(), true)]);
    }

    #[tokio::test]
    async fn failed_open_is_isolated_to_that_peer() {
        let factory = FakeFactory {
            fail_open_for: Some("B".to_string()),
            ..Default::default()
        };
        let mut h = harness_with(factory, Arc::new(NullCapture));
        h.coordinator.start("book-club-42").await.unwrap();
        expect_join(&mut h).await;

        h.coordinator
            .handle_message(roster(&["A", "B"]))
            .await
            .unwrap();
        assert_eq!(h.coordinator.links(), vec![("A".to_string(), true)]);
        match h.outbound.recv().await {
            Some(SignalingMessage::Offer { to_peer, .. }) => assert_eq!(to_peer, "A"),
            other => panic!("expected offer to A, got {:?}", other),
        }
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_offer_drops_the_link() {
        let factory = FakeFactory {
            fail_offer_for: Some("A".to_string()),
            ..Default::default()
        };
        let mut h = harness_with(factory, Arc::new(NullCapture));
        h.coordinator.start("book-club-42").await.unwrap();

        h.coordinator.handle_message(roster(&["A"])).await.unwrap();
        assert!(h.coordinator.links().is_empty());
        assert_eq!(h.factory.peer("A").closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_failure_event_drops_the_link() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        h.coordinator
            .handle_message(roster(&["A", "B"]))
            .await
            .unwrap();

        h.coordinator
            .handle_peer_event(PeerEvent::Failed {
                peer_id: "A".to_string(),
            })
            .await;

        assert_eq!(h.coordinator.links(), vec![("B".to_string(), true)]);
        assert_eq!(h.factory.peer("A").closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.factory.peer("B").closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_drains_everything() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        h.coordinator
            .handle_message(roster(&["A", "B"]))
            .await
            .unwrap();
        let local = h.coordinator.local_stream().unwrap().clone();

        h.coordinator.stop().await.unwrap();

        assert_eq!(h.coordinator.state(), MeshState::Idle);
        assert!(h.coordinator.links().is_empty());
        assert!(h.coordinator.local_stream().is_none());
        assert!(local.is_stopped());
        assert_eq!(h.factory.peer("A").closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.factory.peer("B").closed.load(Ordering::SeqCst), 1);
        assert!(h.coordinator.remote_peers().borrow().is_empty());
    }

    #[tokio::test]
    async fn stop_from_idle_is_a_noop() {
        let mut h = harness();
        h.coordinator.stop().await.unwrap();
        assert_eq!(h.coordinator.state(), MeshState::Idle);
    }

    #[tokio::test]
    async fn remote_set_tracks_arrival_order() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        h.coordinator
            .handle_message(roster(&["A", "B"]))
            .await
            .unwrap();
        h.coordinator
            .handle_message(SignalingMessage::Offer {
                room_id: "book-club-42".to_string(),
                sdp: "offer-sdp".to_string(),
                from_peer: "D".to_string(),
                to_peer: "C".to_string(),
            })
            .await
            .unwrap();

        let ordered: Vec<String> = h
            .coordinator
            .remote_peers()
            .borrow()
            .iter()
            .map(|p| p.peer_id.clone())
            .collect();
        assert_eq!(ordered, vec!["A", "B", "D"]);

        h.coordinator
            .handle_message(SignalingMessage::PeerLeft {
                peer_id: "A".to_string(),
            })
            .await
            .unwrap();
        let ordered: Vec<String> = h
            .coordinator
            .remote_peers()
            .borrow()
            .iter()
            .map(|p| p.peer_id.clone())
            .collect();
        assert_eq!(ordered, vec!["B", "D"]);
    }

    #[tokio::test]
    async fn toggles_gate_the_local_tracks() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        let local = h.coordinator.local_stream().unwrap().clone();

        h.coordinator.set_local_audio_enabled(false);
        assert!(!local.audio_enabled());
        // Repeating a toggle leaves a single stable state.
        h.coordinator.set_local_audio_enabled(true);
        h.coordinator.set_local_audio_enabled(true);
        assert!(local.audio_enabled());
        assert!(local.video_enabled());

        h.coordinator.set_local_video_enabled(false);
        assert!(!local.video_enabled());
    }

    #[tokio::test]
    async fn actor_loop_processes_events_and_stops_cleanly() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        expect_join(&mut h).await;

        let (handle, task) = h.coordinator.spawn();
        let mut remotes = handle.remote_peers();

        h.inbound.send(roster(&["A", "B"])).await.unwrap();
        while remotes.borrow().len() < 2 {
            remotes.changed().await.unwrap();
        }

        handle.set_audio_enabled(false).await.unwrap();

        let handle2 = handle.clone();
        handle.stop().await.unwrap();
        assert!(remotes.borrow_and_update().is_empty());
        assert_eq!(h.factory.peer("A").closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.factory.peer("B").closed.load(Ordering::SeqCst), 1);

        task.await.unwrap().unwrap();

        // Commands and events after teardown must not fire anything.
        assert!(handle2.set_audio_enabled(true).await.is_err());
        assert!(h.inbound.send(roster(&["E"])).await.is_err() || h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn signaling_closure_tears_the_session_down() {
        let mut h = harness();
        h.coordinator.start("book-club-42").await.unwrap();
        h.coordinator.handle_message(roster(&["A"])).await.unwrap();

        let (handle, task) = h.coordinator.spawn();
        drop(h.inbound);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Signaling(_)));
        assert!(handle.remote_peers().borrow().is_empty());
        assert_eq!(h.factory.peer("A").closed.load(Ordering::SeqCst), 1);
    }
}
