use anyhow::{Context, Result};
use multilink_core::control::{DaemonConfig, LinkConfig};
use multilink_core::handoff::{
    self, Claim, DonatedLink, DonorConnection, HandoffError, HandoffListener, PendingDonation,
};
use multilink_core::link::LinkId;
use multilink_core::session::{LeaveOutcome, MultilinkSession};
use multilink_core::transport::{LinkTransport, UdpLink};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

const UDP_RECV_BUF_SIZE: usize = 65536;

/// Outbound packets held while every link is busy
const OUTBOUND_QUEUE_LIMIT: usize = 256;

const LINK_EVENT_CHANNEL_SIZE: usize = 1024;

/// Something a link's receive task observed
enum LinkEvent {
    Frame(LinkId, Vec<u8>),
    Down(LinkId, io::Error),
}

fn parse_addr(raw: &str, what: &str) -> Result<SocketAddr> {
    raw.parse()
        .with_context(|| format!("{what} '{raw}' is not a valid socket address"))
}

/// Resolve a configured link into what the session needs to run it.
fn resolve_link(cfg: &DaemonConfig, link: &LinkConfig) -> Result<DonatedLink> {
    Ok(DonatedLink {
        name: link.name.clone(),
        local_addr: parse_addr(&link.local_addr, "local_addr")?,
        peer_addr: parse_addr(&link.peer_addr, "peer_addr")?,
        weight: link.weight,
        params: cfg.link_params(link)?,
    })
}

fn spawn_receiver(
    id: LinkId,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, _)) => {
                    if events.send(LinkEvent::Frame(id, buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events.send(LinkEvent::Down(id, e)).await;
                    return;
                }
            }
        }
    })
}

const DONATION_CHANNEL_SIZE: usize = 16;

type DonationResult = std::result::Result<PendingDonation, HandoffError>;

async fn next_donor(
    listener: Option<&HandoffListener>,
) -> std::result::Result<DonorConnection, HandoffError> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Read a donor's message off the main loop; it may be slow to write.
fn spawn_donation_reader(connection: DonorConnection, donations: mpsc::Sender<DonationResult>) {
    tokio::spawn(async move {
        let _ = donations.send(connection.read_donation().await).await;
    });
}

/// Member links owned by this daemon, with their receive tasks
struct Links {
    transports: HashMap<LinkId, UdpLink>,
    receivers: HashMap<LinkId, JoinHandle<()>>,
    events: mpsc::Sender<LinkEvent>,
    next_id: LinkId,
}

impl Links {
    fn new(events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            transports: HashMap::new(),
            receivers: HashMap::new(),
            events,
            next_id: 1,
        }
    }

    /// Bind a link and try to add it to the session.
    ///
    /// Returns `Ok(None)` when the session turned the link away.
    async fn bring_up(
        &mut self,
        session: &mut MultilinkSession,
        wanted: &DonatedLink,
        log: &LogFn,
    ) -> Result<Option<LinkId>> {
        let id = self.next_id;
        self.next_id += 1;

        let udp = UdpLink::bind(id, wanted.name.as_str(), wanted.local_addr, wanted.peer_addr)
            .await
            .with_context(|| format!("failed to bind link '{}' to {}", wanted.name, wanted.local_addr))?;

        match session.join(id, wanted.name.as_str(), &wanted.params, wanted.weight) {
            Ok(outcome) => {
                log(format!(
                    "Link {} up: id={id} local={} peer={} weight={} ({outcome:?})",
                    wanted.name,
                    wanted.local_addr,
                    wanted.peer_addr,
                    wanted.weight
                ));
                let receiver = spawn_receiver(id, udp.socket(), self.events.clone());
                self.receivers.insert(id, receiver);
                self.transports.insert(id, udp);
                Ok(Some(id))
            }
            Err(e) => {
                log(format!("Link {} rejected: {e}", wanted.name));
                Ok(None)
            }
        }
    }

    fn take_down(&mut self, id: LinkId) -> Option<UdpLink> {
        if let Some(receiver) = self.receivers.remove(&id) {
            receiver.abort();
        }
        self.transports.remove(&id).map(|mut link| {
            link.close();
            link
        })
    }

    /// Write out everything the scheduler queued.
    async fn flush(&mut self, log: &LogFn) {
        for link in self.transports.values_mut() {
            if link.queue_len() == 0 {
                continue;
            }
            if let Err(e) = link.flush().await {
                log(format!("Link {} send failed: {e}", link.name()));
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, receiver) in self.receivers.drain() {
            receiver.abort();
        }
        for link in self.transports.values_mut() {
            link.close();
        }
    }
}

async fn deliver(socket: &UdpSocket, egress: SocketAddr, packets: Vec<Vec<u8>>, log: &LogFn) {
    for packet in packets {
        if let Err(e) = socket.send_to(&packet, egress).await {
            log(format!("Deliver {} bytes to {egress} failed: {e}", packet.len()));
        }
    }
}

/// Hand every configured link to the process that owns the peer's session.
///
/// Returns the links this process has to run itself, plus the listener if it
/// ended up owning the session after all.
async fn claim_or_donate(
    cfg: &DaemonConfig,
    dir: &std::path::Path,
    log: &LogFn,
) -> Result<(Vec<LinkConfig>, Option<HandoffListener>)> {
    let peer = cfg.peer_id()?;
    let mut own = Vec::new();
    let mut listener = None;

    for link in &cfg.links {
        if listener.is_some() {
            own.push(link.clone());
            continue;
        }

        match handoff::try_claim_or_listen(dir, &peer)
            .await
            .context("failed to open hand-off channel")?
        {
            Claim::Owner(l) => {
                log(format!("Hand-off channel: {}", l.path().display()));
                listener = Some(l);
                own.push(link.clone());
            }
            Claim::Donor(donor) => {
                let donated = resolve_link(cfg, link)?;
                match donor.donate(&donated).await {
                    Ok(()) => log(format!("Link {} handed to session owner", link.name)),
                    Err(e) => log(format!("Link {} hand-off failed: {e}", link.name)),
                }
            }
        }
    }

    Ok((own, listener))
}

pub async fn run_daemon(
    cfg: DaemonConfig,
    mut stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    let peer = cfg.peer_id()?;
    let ingress_addr = parse_addr(&cfg.ingress_addr, "ingress_addr")?;
    let egress_addr = parse_addr(&cfg.egress_addr, "egress_addr")?;

    log(format!(
        "Daemon config: peer={peer} seq={} mrru={} ingress={ingress_addr} egress={egress_addr} links={} health_interval={:?}",
        if cfg.short_seq { "short" } else { "long" },
        cfg.mrru,
        cfg.links.len(),
        cfg.health_interval
    ));

    let (own_links, listener) = match cfg.handoff_dir.as_deref() {
        Some(dir) => claim_or_donate(&cfg, dir, &log).await?,
        None => (cfg.links.clone(), None),
    };

    if own_links.is_empty() && listener.is_none() {
        log("All links handed to the session owner; nothing left to run".to_string());
        return Ok(());
    }

    let ingress = UdpSocket::bind(ingress_addr)
        .await
        .with_context(|| format!("failed to bind ingress socket to {ingress_addr}"))?;
    log(format!("Ingress socket bound: {}", ingress.local_addr()?));

    let (events_tx, mut events_rx) = mpsc::channel(LINK_EVENT_CHANNEL_SIZE);
    let (donations_tx, mut donations_rx) = mpsc::channel(DONATION_CHANNEL_SIZE);
    let mut links = Links::new(events_tx);
    let mut session = MultilinkSession::new(cfg.multilink.clone());

    for link in &own_links {
        let wanted = resolve_link(&cfg, link)?;
        links.bring_up(&mut session, &wanted, &log).await?;
    }

    let mut outbound: VecDeque<Vec<u8>> = VecDeque::new();
    let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];
    let mut tick = tokio::time::interval(cfg.health_interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let stats = session.stats();
                log(format!(
                    "Health tick: members={} out_seq={} next_in={} min_in={} pending={} ({} bytes) in={} delivered={} dropped={} discarded={} duplicates={} format_errors={}",
                    stats.members,
                    stats.out_seq,
                    stats.next_in_seq,
                    stats.min_in_seq,
                    stats.pending_fragments,
                    stats.pending_bytes,
                    stats.fragments_in,
                    stats.reassembly.delivered,
                    stats.reassembly.dropped_fragments,
                    stats.reassembly.discarded_packets,
                    stats.reassembly.duplicates,
                    stats.format_errors
                ));
            }
            recv = ingress.recv_from(&mut buf) => {
                let (n, from) = recv.context("failed to receive on ingress socket")?;
                if !session.is_active() {
                    log(format!("Ingress {n} bytes from {from}: no active session, dropped"));
                    continue;
                }
                if outbound.len() >= OUTBOUND_QUEUE_LIMIT {
                    log(format!("Ingress {n} bytes from {from}: outbound queue full, dropped"));
                    continue;
                }
                outbound.push_back(buf[..n].to_vec());

                // Each pass hands at most one fragment to every idle link.
                loop {
                    let sent = session.distribute(&mut links.transports, &mut outbound);
                    links.flush(&log).await;
                    if sent == 0 {
                        break;
                    }
                }
            }
            Some(event) = events_rx.recv() => {
                let mut delivered = Vec::new();
                match event {
                    LinkEvent::Frame(id, frame) => {
                        session.accept_fragment(id, &frame, &mut delivered);
                    }
                    LinkEvent::Down(id, e) => {
                        if let Some(link) = links.take_down(id) {
                            log(format!("Link {} down: {e}", link.name()));
                        }
                        if session.leave(id) == LeaveOutcome::Closed {
                            log("Last link gone, session closed".to_string());
                        }
                        session.reassemble_pending(&mut delivered);
                    }
                }
                deliver(&ingress, egress_addr, delivered, &log).await;
            }
            connection = next_donor(listener.as_ref()) => {
                match connection {
                    Ok(connection) => spawn_donation_reader(connection, donations_tx.clone()),
                    Err(e) => log(format!("Hand-off accept failed: {e}")),
                }
            }
            Some(donation) = donations_rx.recv() => {
                let pending = match donation {
                    Ok(pending) => pending,
                    Err(e) => {
                        log(format!("Hand-off receive failed: {e}"));
                        continue;
                    }
                };
                let donated = pending.link.clone();
                let joined = match links.bring_up(&mut session, &donated, &log).await {
                    Ok(joined) => joined.is_some(),
                    Err(e) => {
                        log(format!("Donated link {} failed: {e:#}", donated.name));
                        false
                    }
                };
                if joined {
                    log(format!("Link {} joined via hand-off", donated.name));
                }
                if let Err(e) = pending.respond(joined).await {
                    log(format!("Hand-off reply failed: {e}"));
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    log("Stop requested".to_string());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log("Ctrl+C received".to_string());
                break;
            }
        }
    }

    links.shutdown();
    Ok(())
}
