//! TCP transport: client listener, outbound authority dials, one reader and one writer task per connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pest_core::{ConnId, OutboundAction, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where authority connections are dialed.
#[derive(Debug, Clone)]
pub struct AuthorityAddr {
    pub host: String,
    pub port: u16,
}

enum WriteCommand {
    Frame(Vec<u8>),
    /// Flush what is queued, then close.
    Close,
}

/// Core plus the write side of every live connection, behind one lock so actions
/// reach each socket in the order the core produced them.
struct Hub {
    server: Server,
    writers: HashMap<ConnId, mpsc::UnboundedSender<WriteCommand>>,
}

#[derive(Clone)]
struct Transport {
    hub: Arc<Mutex<Hub>>,
    authority: Arc<AuthorityAddr>,
}

/// Accept clients on `listener` until it fails.
pub async fn run_transport(listener: TcpListener, authority: AuthorityAddr) -> std::io::Result<()> {
    let transport = Transport {
        hub: Arc::new(Mutex::new(Hub {
            server: Server::new(),
            writers: HashMap::new(),
        })),
        authority: Arc::new(authority),
    };
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(%addr, "accepted client");
        let t = transport.clone();
        tokio::spawn(async move { t.serve_client(stream).await });
    }
}

impl Transport {
    async fn serve_client(self, stream: TcpStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut hub = self.hub.lock().await;
            let (conn, actions) = hub.server.on_client_connected();
            hub.writers.insert(conn, tx);
            self.apply(&mut hub, actions);
            conn
        };
        self.run_connection(conn, stream, rx).await;
    }

    /// Carry out core actions. Called with the hub locked.
    fn apply(&self, hub: &mut Hub, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Send(conn, bytes) => {
                    if let Some(tx) = hub.writers.get(&conn) {
                        let _ = tx.send(WriteCommand::Frame(bytes));
                    }
                }
                OutboundAction::Close(conn) => {
                    if let Some(tx) = hub.writers.get(&conn) {
                        let _ = tx.send(WriteCommand::Close);
                    }
                }
                OutboundAction::Dial { conn, site } => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    hub.writers.insert(conn, tx);
                    let t = self.clone();
                    tokio::spawn(async move { t.dial(conn, site, rx).await });
                }
            }
        }
    }

    async fn dial(self, conn: ConnId, site: u32, rx: mpsc::UnboundedReceiver<WriteCommand>) {
        let addr = (self.authority.host.as_str(), self.authority.port);
        let result = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(r) => r,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        };
        match result {
            Ok(stream) => {
                {
                    let mut hub = self.hub.lock().await;
                    let actions = hub.server.on_authority_connected(conn);
                    self.apply(&mut hub, actions);
                }
                self.run_connection(conn, stream, rx).await;
            }
            Err(e) => {
                warn!(%conn, site, host = %self.authority.host, port = self.authority.port, error = %e, "authority dial failed");
                let mut hub = self.hub.lock().await;
                hub.writers.remove(&conn);
                let actions = hub.server.on_dial_failed(conn, &e.to_string());
                self.apply(&mut hub, actions);
            }
        }
    }

    async fn run_connection(
        &self,
        conn: ConnId,
        stream: TcpStream,
        rx: mpsc::UnboundedReceiver<WriteCommand>,
    ) {
        let (mut reader, writer) = stream.into_split();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let writer_task = tokio::spawn(write_loop(conn, writer, rx, stop_tx));
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = tokio::select! {
                r = reader.read(&mut buf) => match r {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(%conn, error = %e, "read failed");
                        break;
                    }
                },
                _ = &mut stop_rx => break,
            };
            let mut hub = self.hub.lock().await;
            let actions = hub.server.on_bytes_received(conn, &buf[..n]);
            self.apply(&mut hub, actions);
        }
        {
            let mut hub = self.hub.lock().await;
            hub.writers.remove(&conn);
            hub.server.on_connection_closed(conn);
        }
        let _ = writer_task.await;
        debug!(%conn, "connection finished");
    }
}

async fn write_loop(
    conn: ConnId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    stop: oneshot::Sender<()>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCommand::Frame(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(%conn, error = %e, "write failed");
                    break;
                }
            }
            WriteCommand::Close => {
                while let Ok(WriteCommand::Frame(bytes)) = rx.try_recv() {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                info!(%conn, "closed after protocol error");
                break;
            }
        }
    }
    let _ = stop.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pest_core::protocol::{ObservedPopulation, TargetPopulation};
    use pest_core::{decode_frame, FrameDecodeError, Message, PolicyAction};

    const STEP: Duration = Duration::from_secs(5);

    async fn read_message(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Message> {
        loop {
            match decode_frame(&buf[..]) {
                Ok((frame, n)) => {
                    let msg = Message::decode(frame).unwrap();
                    buf.drain(..n);
                    return Some(msg);
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => panic!("bad frame from server: {e}"),
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(STEP, stream.read(&mut chunk))
                .await
                .expect("timed out waiting for server")
                .unwrap();
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_message(stream: &mut TcpStream, msg: &Message) {
        stream.write_all(&msg.encode().unwrap()).await.unwrap();
    }

    async fn start(authority_port: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let authority = AuthorityAddr {
            host: "127.0.0.1".to_string(),
            port: authority_port,
        };
        tokio::spawn(run_transport(listener, authority));
        port
    }

    fn rat_visit(count: u32) -> Message {
        Message::SiteVisit {
            site: 7,
            populations: vec![ObservedPopulation {
                species: "rat".into(),
                count,
            }],
        }
    }

    #[tokio::test]
    async fn visit_creates_and_deletes_policy_over_authority() {
        let authority = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = start(authority.local_addr().unwrap().port()).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut cbuf = Vec::new();
        assert_eq!(read_message(&mut client, &mut cbuf).await, Some(Message::hello()));
        write_message(&mut client, &Message::hello()).await;
        write_message(&mut client, &rat_visit(20)).await;

        let (mut auth, _) = tokio::time::timeout(STEP, authority.accept())
            .await
            .unwrap()
            .unwrap();
        let mut abuf = Vec::new();
        assert_eq!(read_message(&mut auth, &mut abuf).await, Some(Message::hello()));
        assert_eq!(
            read_message(&mut auth, &mut abuf).await,
            Some(Message::DialAuthority { site: 7 })
        );
        write_message(&mut auth, &Message::hello()).await;
        write_message(
            &mut auth,
            &Message::TargetPopulations {
                site: 7,
                populations: vec![TargetPopulation {
                    species: "rat".into(),
                    min: 0,
                    max: 10,
                }],
            },
        )
        .await;
        assert_eq!(
            read_message(&mut auth, &mut abuf).await,
            Some(Message::CreatePolicy {
                species: "rat".into(),
                action: PolicyAction::Cull,
            })
        );
        write_message(&mut auth, &Message::PolicyResult { policy_id: 77 }).await;

        // Let the result land before the next visit; both arrive on different sockets.
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_message(&mut client, &rat_visit(5)).await;
        assert_eq!(
            read_message(&mut auth, &mut abuf).await,
            Some(Message::DeletePolicy { policy_id: 77 })
        );
    }

    #[tokio::test]
    async fn bad_checksum_gets_error_then_close() {
        let port = start(1).await;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(read_message(&mut client, &mut buf).await, Some(Message::hello()));
        let mut frame = Message::hello().encode().unwrap();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        client.write_all(&frame).await.unwrap();
        assert!(matches!(
            read_message(&mut client, &mut buf).await,
            Some(Message::Error { .. })
        ));
        assert_eq!(read_message(&mut client, &mut buf).await, None);
    }

    #[tokio::test]
    async fn close_flushes_frames_queued_behind_it() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut remote = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();
        let (_reader, writer) = local.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WriteCommand::Frame(Message::hello().encode().unwrap())).unwrap();
        tx.send(WriteCommand::Close).unwrap();
        tx.send(WriteCommand::Frame(Message::error("late").encode().unwrap())).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::time::timeout(STEP, write_loop(ConnId(1), writer, rx, stop_tx))
            .await
            .unwrap();
        assert!(stop_rx.await.is_ok());

        let mut buf = Vec::new();
        assert_eq!(read_message(&mut remote, &mut buf).await, Some(Message::hello()));
        assert_eq!(read_message(&mut remote, &mut buf).await, Some(Message::error("late")));
        assert_eq!(read_message(&mut remote, &mut buf).await, None);
    }

    #[tokio::test]
    async fn unreachable_authority_reports_error_to_client() {
        // Bind then drop to get a port nobody listens on.
        let port_gone = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let port = start(port_gone).await;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(read_message(&mut client, &mut buf).await, Some(Message::hello()));
        write_message(&mut client, &Message::hello()).await;
        write_message(&mut client, &rat_visit(3)).await;
        match read_message(&mut client, &mut buf).await {
            Some(Message::Error { message }) => assert!(message.contains("authority")),
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
