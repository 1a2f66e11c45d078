//! LAN discovery: UDP multicast announcements, heartbeats and leaves.
//!
//! Advertising and browsing share one socket but run as separate tasks with
//! separate cancellation, so either can be stopped without the other.
//!
//! Datagrams are not authenticated. A `Heartbeat` or `Leave` is only taken
//! from the source address that last announced that device, so another host
//! cannot end a peer's presence without spoofing its address. Identity is
//! proven later, in the session handshake.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aero_core::peers::PeerAdvertisement;
use aero_core::protocol::SERVICE_TYPE;
use aero_core::wire::{decode_frame, encode_frame};
use aero_core::{DeviceClass, DeviceId, Keypair, Message, PublicKey, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const MAX_DATAGRAM: usize = 64 * 1024;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// What this node announces about itself.
#[derive(Debug, Clone)]
pub struct SelfDescriptor {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub listen_port: u16,
    pub host: Option<String>,
}

impl SelfDescriptor {
    pub fn new(keypair: &Keypair, display_name: String, device_class: DeviceClass, listen_port: u16) -> Self {
        Self {
            device_id: keypair.device_id(),
            public_key: keypair.public_key().clone(),
            display_name,
            device_class,
            listen_port,
            host: None,
        }
    }

    fn announce(&self) -> Message {
        Message::Announce {
            protocol_version: PROTOCOL_VERSION,
            service: SERVICE_TYPE.to_string(),
            device_id: self.device_id,
            public_key: self.public_key.clone(),
            display_name: self.display_name.clone(),
            device_class: self.device_class,
            fingerprint: self.public_key.fingerprint(),
            listen_port: self.listen_port,
            host: self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub announce: Duration,
    pub heartbeat: Duration,
}

/// One thing seen on the LAN. Advertisements are upserts, not one-shot joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sighting {
    Advertisement(PeerAdvertisement),
    Heartbeat(DeviceId),
    Departure(DeviceId),
}

/// An announcement that could not be turned into a dialable address.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("announced port is 0")]
    NoPort,
    #[error("unusable source address {0}")]
    BadSource(IpAddr),
    #[error("lookup of {host:?} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("lookup of {0:?} timed out or returned nothing")]
    NoAddress(String),
    #[error("device id does not match public key")]
    KeyMismatch,
}

/// Bound discovery socket. Cheap to clone.
#[derive(Clone)]
pub struct Discovery {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    self_id: DeviceId,
    /// Our current announcement, used to answer newly seen peers. `None` while not advertising.
    reply: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Discovery {
    /// Join the multicast group on `port`.
    pub async fn bind(port: u16, self_id: DeviceId) -> io::Result<Self> {
        let socket = make_multicast_socket(port)?;
        Ok(Self::with_socket(
            socket,
            SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), port),
            self_id,
        ))
    }

    /// Use an already bound socket that sends to `target` (any unicast or multicast address).
    pub fn with_socket(socket: UdpSocket, target: SocketAddr, self_id: DeviceId) -> Self {
        Self {
            socket: Arc::new(socket),
            target,
            self_id,
            reply: Arc::new(Mutex::new(None)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Announce now and every `announce` interval; heartbeat every `heartbeat` interval.
    pub fn start_advertising(&self, me: SelfDescriptor, intervals: Intervals) -> io::Result<Advertiser> {
        let announce = frame(&me.announce())?;
        let heartbeat = frame(&Message::Heartbeat { device_id: me.device_id })?;
        let leave = frame(&Message::Leave { device_id: me.device_id })?;
        set_reply(&self.reply, Some(announce.clone()));

        let cancel = CancellationToken::new();
        let socket = self.socket.clone();
        let target = self.target;
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut announce_tick = tokio::time::interval(intervals.announce);
            let mut heartbeat_tick = tokio::time::interval(intervals.heartbeat);
            // The first heartbeat tick would coincide with the initial announce.
            heartbeat_tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = announce_tick.tick() => {
                        if let Err(e) = socket.send_to(&announce, target).await {
                            debug!(error = %e, "announce send failed");
                        }
                    }
                    _ = heartbeat_tick.tick() => {
                        if let Err(e) = socket.send_to(&heartbeat, target).await {
                            debug!(error = %e, "heartbeat send failed");
                        }
                    }
                }
            }
        });
        Ok(Advertiser {
            cancel,
            task,
            socket: self.socket.clone(),
            target,
            leave,
            reply: self.reply.clone(),
        })
    }

    /// Start receiving. The returned stream is unbounded and ends only when stopped.
    /// Call again after `stop` to restart.
    pub fn start_browsing(&self) -> Browser {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut known = Known::default();
            // Host name lookups finish here so they never hold up other peers.
            let (resolved_tx, mut resolved_rx) =
                mpsc::unbounded_channel::<(SocketAddr, Result<PeerAdvertisement, ResolutionError>)>();
            loop {
                let sighting = tokio::select! {
                    _ = token.cancelled() => break,
                    Some((from, result)) = resolved_rx.recv() => {
                        match this.on_resolved(from, result, &mut known).await {
                            Some(s) => s,
                            None => continue,
                        }
                    }
                    r = this.socket.recv_from(&mut buf) => {
                        let (n, from) = match r {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(error = %e, "discovery receive failed");
                                continue;
                            }
                        };
                        let Some(inbound) = this.decode(&buf[..n], from) else {
                            continue;
                        };
                        match inbound {
                            Inbound::Announce(a) if a.needs_lookup() => {
                                let resolved_tx = resolved_tx.clone();
                                tokio::spawn(async move {
                                    let result = a.resolve(from).await;
                                    let _ = resolved_tx.send((from, result));
                                });
                                continue;
                            }
                            Inbound::Announce(a) => {
                                let result = a.resolve(from).await;
                                match this.on_resolved(from, result, &mut known).await {
                                    Some(s) => s,
                                    None => continue,
                                }
                            }
                            Inbound::Heartbeat(id) | Inbound::Leave(id)
                                if known.sources.get(&id) != Some(&from.ip()) =>
                            {
                                debug!(%from, peer_id = %id, "ignoring liveness datagram from unexpected source");
                                continue;
                            }
                            Inbound::Heartbeat(id) => Sighting::Heartbeat(id),
                            Inbound::Leave(id) => {
                                known.replied.remove(&id);
                                Sighting::Departure(id)
                            }
                        }
                    }
                };
                if tx.send(sighting).is_err() {
                    break;
                }
            }
        });
        Browser { rx, cancel, task }
    }

    /// Decode one datagram. `None` for noise, our own datagrams, or other services.
    fn decode(&self, bytes: &[u8], from: SocketAddr) -> Option<Inbound> {
        let msg: Message = match decode_frame(bytes) {
            Ok((m, _)) => m,
            Err(e) => {
                trace!(%from, error = %e, "ignoring undecodable datagram");
                return None;
            }
        };
        if msg.device_id() == self.self_id {
            return None;
        }
        match msg {
            Message::Announce {
                protocol_version,
                ref service,
                ..
            } if protocol_version != PROTOCOL_VERSION || service != SERVICE_TYPE => {
                trace!(%from, protocol_version, "ignoring foreign announcement");
                None
            }
            Message::Announce {
                device_id,
                public_key,
                display_name,
                device_class,
                fingerprint,
                listen_port,
                host,
                ..
            } => Some(Inbound::Announce(Announcement {
                device_id,
                public_key,
                display_name,
                device_class,
                fingerprint,
                listen_port,
                host,
            })),
            Message::Heartbeat { device_id } => Some(Inbound::Heartbeat(device_id)),
            Message::Leave { device_id } => Some(Inbound::Leave(device_id)),
        }
    }

    async fn on_resolved(
        &self,
        from: SocketAddr,
        result: Result<PeerAdvertisement, ResolutionError>,
        known: &mut Known,
    ) -> Option<Sighting> {
        let adv = match result {
            Ok(adv) => adv,
            Err(e) => {
                debug!(%from, error = %e, "discovery resolution failed, dropping advertisement");
                return None;
            }
        };
        known.sources.insert(adv.device_id, from.ip());
        if known.replied.insert(adv.device_id) {
            self.reply_to(from).await;
        }
        Some(Sighting::Advertisement(adv))
    }

    async fn reply_to(&self, to: SocketAddr) {
        let frame = match self.reply.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(frame) = frame {
            if let Err(e) = self.socket.send_to(&frame, to).await {
                debug!(%to, error = %e, "unicast announce reply failed");
            }
        }
    }
}

enum Inbound {
    Announce(Announcement),
    Heartbeat(DeviceId),
    Leave(DeviceId),
}

/// An `Announce` before its address is resolved.
struct Announcement {
    device_id: DeviceId,
    public_key: PublicKey,
    display_name: String,
    device_class: DeviceClass,
    fingerprint: String,
    listen_port: u16,
    host: Option<String>,
}

impl Announcement {
    /// The host is a name that needs a DNS lookup.
    fn needs_lookup(&self) -> bool {
        self.host
            .as_deref()
            .is_some_and(|h| !h.is_empty() && h.parse::<IpAddr>().is_err())
    }

    async fn resolve(self, from: SocketAddr) -> Result<PeerAdvertisement, ResolutionError> {
        let address = resolve(
            self.device_id,
            &self.public_key,
            self.host.as_deref(),
            self.listen_port,
            from,
        )
        .await?;
        Ok(PeerAdvertisement {
            device_id: self.device_id,
            public_key: self.public_key,
            display_name: self.display_name,
            device_class: self.device_class,
            fingerprint: self.fingerprint,
            address,
        })
    }
}

/// Browser bookkeeping per announced device.
#[derive(Default)]
struct Known {
    /// Devices we already answered with our own announcement.
    replied: HashSet<DeviceId>,
    /// Source IP of each device's latest resolved announcement.
    sources: HashMap<DeviceId, IpAddr>,
}

/// Running advertiser. `stop` sends a `Leave` first.
pub struct Advertiser {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    leave: Vec<u8>,
    reply: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Advertiser {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        set_reply(&self.reply, None);
        if let Err(e) = self.socket.send_to(&self.leave, self.target).await {
            debug!(error = %e, "leave send failed");
        }
    }
}

/// Running browser: a stream of sightings.
pub struct Browser {
    rx: mpsc::UnboundedReceiver<Sighting>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Browser {
    pub async fn next(&mut self) -> Option<Sighting> {
        self.rx.recv().await
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Turn an announcement into a dialable address: explicit host if given, else the datagram source.
pub async fn resolve(
    device_id: DeviceId,
    public_key: &PublicKey,
    host: Option<&str>,
    listen_port: u16,
    from: SocketAddr,
) -> Result<SocketAddr, ResolutionError> {
    if !device_id.matches(public_key) {
        return Err(ResolutionError::KeyMismatch);
    }
    if listen_port == 0 {
        return Err(ResolutionError::NoPort);
    }
    let Some(host) = host.filter(|h| !h.is_empty()) else {
        let ip = from.ip();
        if ip.is_unspecified() || ip.is_multicast() {
            return Err(ResolutionError::BadSource(ip));
        }
        return Ok(SocketAddr::new(ip, listen_port));
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_unspecified() || ip.is_multicast() {
            return Err(ResolutionError::BadSource(ip));
        }
        return Ok(SocketAddr::new(ip, listen_port));
    }
    let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, tokio::net::lookup_host((host, listen_port))).await;
    match lookup {
        Ok(Ok(mut addrs)) => addrs
            .find(|a| a.is_ipv4())
            .ok_or_else(|| ResolutionError::NoAddress(host.to_string())),
        Ok(Err(source)) => Err(ResolutionError::Lookup {
            host: host.to_string(),
            source,
        }),
        Err(_) => Err(ResolutionError::NoAddress(host.to_string())),
    }
}

fn frame(msg: &Message) -> io::Result<Vec<u8>> {
    encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn set_reply(slot: &Mutex<Option<Vec<u8>>>, value: Option<Vec<u8>>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = value;
    }
}

fn make_multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_pair(a: &Keypair, b: &Keypair) -> (Discovery, Discovery) {
        let sa = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sb = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (addr_a, addr_b) = (sa.local_addr().unwrap(), sb.local_addr().unwrap());
        (
            Discovery::with_socket(sa, addr_b, a.device_id()),
            Discovery::with_socket(sb, addr_a, b.device_id()),
        )
    }

    fn intervals() -> Intervals {
        Intervals {
            announce: Duration::from_millis(200),
            heartbeat: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn resolve_uses_source_ip() {
        let kp = Keypair::generate();
        let from: SocketAddr = "192.168.1.20:45678".parse().unwrap();
        let addr = resolve(kp.device_id(), kp.public_key(), None, 45679, from)
            .await
            .unwrap();
        assert_eq!(addr, "192.168.1.20:45679".parse().unwrap());
    }

    #[tokio::test]
    async fn resolve_prefers_explicit_host() {
        let kp = Keypair::generate();
        let from: SocketAddr = "192.168.1.20:45678".parse().unwrap();
        let addr = resolve(kp.device_id(), kp.public_key(), Some("10.1.2.3"), 7000, from)
            .await
            .unwrap();
        assert_eq!(addr, "10.1.2.3:7000".parse().unwrap());
    }

    #[tokio::test]
    async fn resolve_failures() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let from: SocketAddr = "192.168.1.20:45678".parse().unwrap();
        assert!(matches!(
            resolve(kp.device_id(), kp.public_key(), None, 0, from).await,
            Err(ResolutionError::NoPort)
        ));
        assert!(matches!(
            resolve(kp.device_id(), other.public_key(), None, 1, from).await,
            Err(ResolutionError::KeyMismatch)
        ));
        let unspecified: SocketAddr = "0.0.0.0:45678".parse().unwrap();
        assert!(matches!(
            resolve(kp.device_id(), kp.public_key(), None, 1, unspecified).await,
            Err(ResolutionError::BadSource(_))
        ));
        assert!(resolve(kp.device_id(), kp.public_key(), Some("no-such-host.invalid"), 1, from)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn browse_sees_advertiser() {
        let (ka, kb) = (Keypair::generate(), Keypair::generate());
        let (da, db) = loopback_pair(&ka, &kb).await;
        let me = SelfDescriptor::new(&ka, "DeskA".into(), DeviceClass::Desktop, 45679);
        let advertiser = da.start_advertising(me, intervals()).unwrap();
        let mut browser = db.start_browsing();

        let first = tokio::time::timeout(Duration::from_secs(2), browser.next())
            .await
            .unwrap()
            .unwrap();
        match first {
            Sighting::Advertisement(adv) => {
                assert_eq!(adv.device_id, ka.device_id());
                assert_eq!(adv.display_name, "DeskA");
                assert_eq!(adv.address, "127.0.0.1:45679".parse().unwrap());
                assert_eq!(adv.fingerprint, ka.public_key().fingerprint());
            }
            other => panic!("expected advertisement, got {other:?}"),
        }
        let hb = tokio::time::timeout(Duration::from_secs(2), browser.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hb, Sighting::Heartbeat(ka.device_id()));

        advertiser.stop().await;
        let mut departed = false;
        while let Ok(Some(s)) = tokio::time::timeout(Duration::from_secs(2), browser.next()).await {
            if s == Sighting::Departure(ka.device_id()) {
                departed = true;
                break;
            }
        }
        assert!(departed);
        browser.stop().await;
    }

    #[tokio::test]
    async fn stopping_browser_keeps_advertising() {
        let (ka, kb) = (Keypair::generate(), Keypair::generate());
        let (da, db) = loopback_pair(&ka, &kb).await;
        let me = SelfDescriptor::new(&ka, "A".into(), DeviceClass::Laptop, 1);
        let advertiser = da.start_advertising(me, intervals()).unwrap();
        da.start_browsing().stop().await;

        let mut browser = db.start_browsing();
        let got = tokio::time::timeout(Duration::from_secs(2), browser.next()).await;
        assert!(matches!(got, Ok(Some(_))));
        browser.stop().await;
        advertiser.stop().await;
    }

    #[tokio::test]
    async fn own_datagrams_ignored() {
        let kp = Keypair::generate();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let d = Discovery::with_socket(sock, addr, kp.device_id());
        let bytes = frame(&Message::Heartbeat { device_id: kp.device_id() }).unwrap();
        assert!(d.decode(&bytes, addr).is_none());
        assert!(d.decode(b"garbage", addr).is_none());
    }

    #[tokio::test]
    async fn foreign_service_ignored() {
        let (kp, other) = (Keypair::generate(), Keypair::generate());
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let d = Discovery::with_socket(sock, addr, kp.device_id());
        let bytes = frame(&Message::Announce {
            protocol_version: PROTOCOL_VERSION,
            service: "_other._tcp".into(),
            device_id: other.device_id(),
            public_key: other.public_key().clone(),
            display_name: "x".into(),
            device_class: DeviceClass::Unknown,
            fingerprint: String::new(),
            listen_port: 1,
            host: None,
        })
        .unwrap();
        assert!(d.decode(&bytes, addr).is_none());
    }

    #[tokio::test]
    async fn forged_leave_from_other_host_is_ignored() {
        let (ka, kb) = (Keypair::generate(), Keypair::generate());
        let (da, db) = loopback_pair(&ka, &kb).await;
        let me = SelfDescriptor::new(&ka, "DeskA".into(), DeviceClass::Desktop, 45679);
        let advertiser = da.start_advertising(me, intervals()).unwrap();
        let mut browser = db.start_browsing();
        let first = tokio::time::timeout(Duration::from_secs(2), browser.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Sighting::Advertisement(_)));

        let forger = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        let leave = frame(&Message::Leave { device_id: ka.device_id() }).unwrap();
        forger.send_to(&leave, db.local_addr().unwrap()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        while let Ok(Some(s)) = tokio::time::timeout_at(deadline, browser.next()).await {
            assert_ne!(s, Sighting::Departure(ka.device_id()));
        }

        advertiser.stop().await;
        let mut departed = false;
        while let Ok(Some(s)) = tokio::time::timeout(Duration::from_secs(2), browser.next()).await {
            if s == Sighting::Departure(ka.device_id()) {
                departed = true;
                break;
            }
        }
        assert!(departed);
        browser.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_before_any_announcement_is_dropped() {
        let (ka, kb) = (Keypair::generate(), Keypair::generate());
        let (_da, db) = loopback_pair(&ka, &kb).await;
        let mut browser = db.start_browsing();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hb = frame(&Message::Heartbeat { device_id: ka.device_id() }).unwrap();
        sender.send_to(&hb, db.local_addr().unwrap()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), browser.next()).await;
        assert!(got.is_err());
        browser.stop().await;
    }

    #[test]
    fn only_host_names_need_a_lookup() {
        let kp = Keypair::generate();
        let announcement = |host: Option<&str>| Announcement {
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            display_name: "x".into(),
            device_class: DeviceClass::Unknown,
            fingerprint: String::new(),
            listen_port: 1,
            host: host.map(String::from),
        };
        assert!(!announcement(None).needs_lookup());
        assert!(!announcement(Some("")).needs_lookup());
        assert!(!announcement(Some("192.168.1.9")).needs_lookup());
        assert!(announcement(Some("desk.local")).needs_lookup());
    }
}
