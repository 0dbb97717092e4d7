use anyhow::Result;
use base64::Engine;
use multilink_core::control::{DaemonConfig, LinkConfig};
use multilink_core::link::DiscriminatorClass;
use multilinkd::runtime::run_daemon;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type Log = Arc<Mutex<Vec<String>>>;

/// Reserve a loopback port the OS considers free right now.
fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .expect("Failed to reserve port")
        .port()
}

fn addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

fn link(name: &str, local: u16, peer: u16, weight: u32) -> LinkConfig {
    LinkConfig {
        name: name.to_string(),
        local_addr: addr(local),
        peer_addr: addr(peer),
        weight,
        short_seq: None,
        mrru: None,
    }
}

fn daemon_config(ingress: u16, egress: u16, links: Vec<LinkConfig>) -> DaemonConfig {
    DaemonConfig {
        peer_authname: "peer".to_string(),
        peer_enddisc_class: DiscriminatorClass::Mac,
        peer_enddisc_b64: Some(
            base64::engine::general_purpose::STANDARD.encode([0x00, 0x1b, 0x21, 0x3a, 0x4c, 0x5d]),
        ),
        mrru: 4000,
        ingress_addr: addr(ingress),
        egress_addr: addr(egress),
        health_interval: Duration::from_secs(60),
        links,
        ..Default::default()
    }
}

fn spawn_daemon(
    tag: &'static str,
    cfg: DaemonConfig,
) -> (watch::Sender<bool>, Log, JoinHandle<Result<()>>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log_clone = log.clone();

    let handle = tokio::spawn(async move {
        run_daemon(
            cfg,
            stop_rx,
            Box::new(move |msg| {
                println!("[{tag}] {msg}");
                log_clone.lock().unwrap().push(msg);
            }),
        )
        .await
    });

    (stop_tx, log, handle)
}

async fn wait_for_log(log: &Log, needle: &str) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if log.lock().unwrap().iter().any(|m| m.contains(needle)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn recv_timeout(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 65536];
    match tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await {
        Ok(Ok((n, _))) => Some(buf[..n].to_vec()),
        _ => None,
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_packets_cross_two_link_bundle() -> Result<()> {
    let (a0, a1, b0, b1) = (free_port(), free_port(), free_port(), free_port());

    // Upper layers on both ends are plain sockets owned by the test.
    let upper_a = UdpSocket::bind("127.0.0.1:0").await?;
    let upper_b = UdpSocket::bind("127.0.0.1:0").await?;
    let (ingress_a, ingress_b) = (free_port(), free_port());

    let cfg_a = daemon_config(
        ingress_a,
        upper_a.local_addr()?.port(),
        vec![link("a0", a0, b0, 1500), link("a1", a1, b1, 1500)],
    );
    let cfg_b = daemon_config(
        ingress_b,
        upper_b.local_addr()?.port(),
        vec![link("b0", b0, a0, 1500), link("b1", b1, a1, 1500)],
    );

    let (stop_a, log_a, handle_a) = spawn_daemon("A", cfg_a);
    let (stop_b, log_b, handle_b) = spawn_daemon("B", cfg_b);

    assert!(wait_for_log(&log_a, "Link a1 up").await);
    assert!(wait_for_log(&log_b, "Link b1 up").await);

    // A 3000 byte packet has to be split over both links and put back together.
    let packets = vec![pattern(3000, 1), pattern(40, 2), pattern(1600, 3)];
    let mut received = Vec::new();
    for packet in &packets {
        upper_a.send_to(packet, addr(ingress_a)).await?;
        match recv_timeout(&upper_b).await {
            Some(p) => received.push(p),
            None => break,
        }
    }

    // And the other way round.
    let reply = pattern(2500, 9);
    upper_b.send_to(&reply, addr(ingress_b)).await?;
    let reply_received = recv_timeout(&upper_a).await;

    let _ = stop_a.send(true);
    let _ = stop_b.send(true);
    let _ = handle_a.await;
    let _ = handle_b.await;

    if received != packets || reply_received.as_ref() != Some(&reply) {
        println!("A logs: {:#?}", log_a.lock().unwrap());
        println!("B logs: {:#?}", log_b.lock().unwrap());
        anyhow::bail!("Test failed: packets did not cross the bundle intact");
    }

    Ok(())
}

#[tokio::test]
async fn test_link_with_mismatched_mrru_is_rejected() -> Result<()> {
    let mut odd = link("odd", free_port(), free_port(), 1500);
    odd.mrru = Some(1200);
    let cfg = daemon_config(
        free_port(),
        free_port(),
        vec![link("good", free_port(), free_port(), 1500), odd],
    );

    let (stop, log, handle) = spawn_daemon("D", cfg);

    let rejected = wait_for_log(&log, "Link odd rejected").await;
    let _ = stop.send(true);
    handle.await??;

    assert!(rejected, "link with a different MRRU should be turned away");
    assert!(log.lock().unwrap().iter().any(|m| m.contains("Link good up")));
    Ok(())
}

#[tokio::test]
async fn test_second_daemon_hands_link_to_owner() -> Result<()> {
    let dir: PathBuf = std::env::temp_dir().join(format!("multilinkd-handoff-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir)?;

    let mut owner_cfg = daemon_config(
        free_port(),
        free_port(),
        vec![link("first", free_port(), free_port(), 1500)],
    );
    owner_cfg.handoff_dir = Some(dir.clone());

    let mut donor_cfg = daemon_config(
        free_port(),
        free_port(),
        vec![link("second", free_port(), free_port(), 900)],
    );
    donor_cfg.handoff_dir = Some(dir.clone());

    let (stop_owner, owner_log, owner_handle) = spawn_daemon("OWNER", owner_cfg);
    assert!(wait_for_log(&owner_log, "Hand-off channel").await);

    let (_stop_donor, donor_log, donor_handle) = spawn_daemon("DONOR", donor_cfg);

    // The donor gives its only link away and exits.
    tokio::time::timeout(Duration::from_secs(5), donor_handle).await???;
    assert!(donor_log
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.contains("Link second handed to session owner")));
    assert!(wait_for_log(&owner_log, "Link second joined via hand-off").await);

    let _ = stop_owner.send(true);
    owner_handle.await??;

    // The owner removes its channel on the way out.
    assert!(std::fs::read_dir(&dir)?.next().is_none());
    Ok(())
}
