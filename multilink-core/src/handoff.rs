//! Cross-process session hand-off.
//!
//! Several daemon instances may each bring up a link to the same peer. The first
//! to get there owns the session and listens on a local socket named after the
//! peer's identity; the others connect to it and donate their link instead of
//! starting a second session.
//!
//! Each donation is one length-prefixed JSON message describing the link,
//! answered by a single verdict byte from the owner.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::link::{LinkParams, PeerId};

/// Largest donation message accepted
const MAX_MESSAGE_LEN: u32 = 64 * 1024;

const VERDICT_REJECTED: u8 = 0;
const VERDICT_ACCEPTED: u8 = 1;

/// Hand-off errors
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed donation: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Donation message too large: {0} bytes")]
    TooLarge(u32),

    #[error("Session owner rejected link '{0}'")]
    Rejected(String),
}

/// A link handed from one daemon to the session owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonatedLink {
    pub name: String,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub weight: u32,
    pub params: LinkParams,
}

/// Socket path for the session with `peer`: `<dir>/ppp-<authname>-<class>-<address>`,
/// with the discriminator class and address bytes in hex.
///
/// Authname bytes other than ASCII alphanumerics, `.`, `_`, `-` and `@` are
/// written as `%XX`, so the name always stays a single entry inside `dir`.
pub fn channel_path(dir: &Path, peer: &PeerId) -> PathBuf {
    let mut name = String::from("ppp-");
    for byte in peer.authname.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-' | b'@') {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, "%{byte:02x}");
        }
    }
    let _ = write!(name, "-{:02x}-", peer.enddisc.class.code());
    for byte in &peer.enddisc.address {
        let _ = write!(name, "{byte:02x}");
    }
    dir.join(name)
}

/// Outcome of trying to claim a peer's session
pub enum Claim {
    /// Nobody owned the session; we do now
    Owner(HandoffListener),
    /// Another process owns the session; links go to it
    Donor(HandoffDonor),
}

/// Claim the session for `peer`, or connect to the process that already has it.
///
/// A socket file left behind by a dead owner is removed and the claim retried.
pub async fn try_claim_or_listen(dir: &Path, peer: &PeerId) -> Result<Claim, HandoffError> {
    let path = channel_path(dir, peer);

    match UnixListener::bind(&path) {
        Ok(listener) => {
            info!(path = %path.display(), "MP: listening for donated links");
            Ok(Claim::Owner(HandoffListener { path, listener }))
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => match UnixStream::connect(&path).await {
            Ok(stream) => {
                info!(path = %path.display(), "MP: session owned elsewhere, will donate links");
                Ok(Claim::Donor(HandoffDonor { path, stream }))
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!(path = %path.display(), "MP: removing stale hand-off socket");
                std::fs::remove_file(&path)?;
                let listener = UnixListener::bind(&path)?;
                Ok(Claim::Owner(HandoffListener { path, listener }))
            }
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

/// Owner side of the hand-off channel
pub struct HandoffListener {
    path: PathBuf,
    listener: UnixListener,
}

impl HandoffListener {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next donor to connect.
    ///
    /// Cancel safe: nothing is read here, so dropping the future loses no
    /// connection. Read the donation with [`DonorConnection::read_donation`].
    pub async fn accept(&self) -> Result<DonorConnection, HandoffError> {
        let (stream, _) = self.listener.accept().await?;
        Ok(DonorConnection { stream })
    }
}

impl Drop for HandoffListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connected donor whose message has not been read yet
pub struct DonorConnection {
    stream: UnixStream,
}

impl DonorConnection {
    /// Read the donated link. The donor may connect well before it writes.
    pub async fn read_donation(mut self) -> Result<PendingDonation, HandoffError> {
        let link: DonatedLink = read_message(&mut self.stream).await?;
        debug!(link = %link.name, "MP: link donation received");
        Ok(PendingDonation {
            link,
            stream: self.stream,
        })
    }
}

/// A donation waiting for the owner's verdict
pub struct PendingDonation {
    pub link: DonatedLink,
    stream: UnixStream,
}

impl PendingDonation {
    /// Tell the donor whether its link joined the session.
    pub async fn respond(mut self, accepted: bool) -> Result<(), HandoffError> {
        let verdict = if accepted {
            VERDICT_ACCEPTED
        } else {
            VERDICT_REJECTED
        };
        self.stream.write_all(&[verdict]).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Donor side of the hand-off channel
pub struct HandoffDonor {
    path: PathBuf,
    stream: UnixStream,
}

impl HandoffDonor {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand `link` to the session owner and wait for its verdict.
    ///
    /// The donor must have released the link's socket beforehand so the owner
    /// can bind it.
    pub async fn donate(mut self, link: &DonatedLink) -> Result<(), HandoffError> {
        write_message(&mut self.stream, link).await?;

        let mut verdict = [0u8; 1];
        self.stream.read_exact(&mut verdict).await?;
        if verdict[0] == VERDICT_ACCEPTED {
            info!(link = %link.name, "MP: link donated to session owner");
            Ok(())
        } else {
            Err(HandoffError::Rejected(link.name.clone()))
        }
    }
}

async fn write_message<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), HandoffError> {
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len()).map_err(|_| HandoffError::TooLarge(u32::MAX))?;
    if len > MAX_MESSAGE_LEN {
        return Err(HandoffError::TooLarge(len));
    }
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message<T: for<'de> Deserialize<'de>>(stream: &mut UnixStream) -> Result<T, HandoffError> {
    let len = stream.read_u32().await?;
    if len > MAX_MESSAGE_LEN {
        return Err(HandoffError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{DiscriminatorClass, EndpointDiscriminator};
    use crate::sequence::SeqWidth;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "multilink-handoff-{}-{name}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn peer() -> PeerId {
        PeerId::new(
            "bob",
            EndpointDiscriminator::new(DiscriminatorClass::Ip, vec![192, 168, 0, 1]),
        )
    }

    fn donated() -> DonatedLink {
        DonatedLink {
            name: "ppp3".to_string(),
            local_addr: "127.0.0.1:7003".parse().unwrap(),
            peer_addr: "127.0.0.1:7103".parse().unwrap(),
            weight: 800,
            params: LinkParams {
                seq_width: SeqWidth::Long,
                mrru: 1500,
                peer: peer(),
            },
        }
    }

    #[test]
    fn test_channel_path() {
        let path = channel_path(Path::new("/var/run"), &peer());
        assert_eq!(path, PathBuf::from("/var/run/ppp-bob-02-c0a80001"));

        let path = channel_path(Path::new("/tmp"), &PeerId::default());
        assert_eq!(path, PathBuf::from("/tmp/ppp--00-"));
    }

    #[test]
    fn test_channel_path_stays_in_dir() {
        let dir = Path::new("/var/run");
        for authname in ["../../etc/passwd", "a/b", "..", "x y\\z"] {
            let peer = PeerId::new(authname, EndpointDiscriminator::null());
            let path = channel_path(dir, &peer);
            assert_eq!(path.parent(), Some(dir), "authname {authname:?}");
            assert!(!path.file_name().unwrap().to_string_lossy().contains('/'));
        }

        let peer = PeerId::new("../x", EndpointDiscriminator::null());
        assert_eq!(channel_path(dir, &peer), PathBuf::from("/var/run/ppp-..%2fx-00-"));
    }

    #[tokio::test]
    async fn test_donation_survives_cancelled_wait() {
        let dir = scratch_dir("cancel");

        let Claim::Owner(owner) = try_claim_or_listen(&dir, &peer()).await.unwrap() else {
            panic!("expected ownership");
        };
        let Claim::Donor(donor) = try_claim_or_listen(&dir, &peer()).await.unwrap() else {
            panic!("expected donor");
        };

        // The donor connected already but only writes a while later.
        let donate = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            donor.donate(&donated()).await
        });

        // An owner busy with other events keeps dropping its wait for a donor.
        let connection = loop {
            tokio::select! {
                conn = owner.accept() => break conn.expect("accept failed"),
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            }
        };

        let pending = connection.read_donation().await.expect("read failed");
        assert_eq!(pending.link, donated());
        pending.respond(true).await.unwrap();
        donate.await.unwrap().expect("donation should be accepted");
    }

    #[tokio::test]
    async fn test_owner_then_donor() {
        let dir = scratch_dir("donate");

        let owner = match try_claim_or_listen(&dir, &peer()).await.unwrap() {
            Claim::Owner(listener) => listener,
            Claim::Donor(_) => panic!("first claim should own the session"),
        };
        let donor = match try_claim_or_listen(&dir, &peer()).await.unwrap() {
            Claim::Donor(donor) => donor,
            Claim::Owner(_) => panic!("second claim should donate"),
        };
        assert_eq!(donor.path(), owner.path());

        let link = donated();
        let donate = tokio::spawn(async move { donor.donate(&link).await });

        let pending = owner
            .accept()
            .await
            .expect("accept failed")
            .read_donation()
            .await
            .expect("read failed");
        assert_eq!(pending.link, donated());
        pending.respond(true).await.unwrap();

        donate.await.unwrap().expect("donation should be accepted");

        let path = owner.path().to_path_buf();
        drop(owner);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rejected_donation() {
        let dir = scratch_dir("reject");

        let Claim::Owner(owner) = try_claim_or_listen(&dir, &peer()).await.unwrap() else {
            panic!("expected ownership");
        };
        let Claim::Donor(donor) = try_claim_or_listen(&dir, &peer()).await.unwrap() else {
            panic!("expected donor");
        };

        let donate = tokio::spawn(async move { donor.donate(&donated()).await });
        let pending = owner.accept().await.unwrap().read_donation().await.unwrap();
        pending.respond(false).await.unwrap();

        let result = donate.await.unwrap();
        assert!(matches!(result, Err(HandoffError::Rejected(name)) if name == "ppp3"));
    }

    #[tokio::test]
    async fn test_stale_socket_reclaimed() {
        let dir = scratch_dir("stale");
        let path = channel_path(&dir, &peer());

        // A listener that died without cleaning up leaves its socket file.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let claim = try_claim_or_listen(&dir, &peer()).await.unwrap();
        assert!(matches!(claim, Claim::Owner(_)));
    }

    #[tokio::test]
    async fn test_distinct_peers_distinct_channels() {
        let dir = scratch_dir("distinct");
        let other = PeerId::new("carol", EndpointDiscriminator::null());

        let first = try_claim_or_listen(&dir, &peer()).await.unwrap();
        let second = try_claim_or_listen(&dir, &other).await.unwrap();
        assert!(matches!(first, Claim::Owner(_)));
        assert!(matches!(second, Claim::Owner(_)));
    }
}
