//! Reference multiverse server.
//!
//! Speaks the same framing and codec as the client. One tokio task per
//! connection; all connections share one [`World`]. Every response is encoded
//! in the wire format the request arrived in.

pub mod world;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{read_header, HandshakeAck, Message, Update, WireCodec};
use crate::state::ObjectDeclaration;
use crate::transport::frame::{decode_frame, encode_frame};

pub use world::{ConnectionId, World};

/// Running server; dropping it does not stop the accept loop, call `shutdown`
pub struct ServerHandle {
    local_addr: SocketAddr,
    world: Arc<World>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address in the form clients are configured with
    pub fn address(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    pub fn world(&self) -> Arc<World> {
        self.world.clone()
    }

    /// Stop accepting, close every connection and wait for the accept loop
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        info!(addr = %self.local_addr, "Server stopped");
    }
}

/// Bind and start serving in the background
pub async fn bind(addr: &str) -> Result<ServerHandle> {
    bind_with_world(addr, Arc::new(World::new())).await
}

/// Like [`bind`], reusing an existing world (e.g. across restarts)
pub async fn bind_with_world(addr: &str, world: Arc<World>) -> Result<ServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(accept_loop(listener, world.clone(), shutdown_rx));
    info!(addr = %local_addr, "Multiverse server listening");

    Ok(ServerHandle {
        local_addr,
        world,
        shutdown,
        task,
    })
}

/// Serve until Ctrl-C
pub async fn serve(addr: &str) -> Result<()> {
    let server = bind(addr).await?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    server.shutdown().await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, world: Arc<World>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Client connected");
                    let world = world.clone();
                    let shutdown = shutdown.clone();
                    connections.push(tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, world, shutdown).await {
                            debug!(%peer, error = %e, "Connection ended with error");
                        }
                    }));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
        connections.retain(|task: &JoinHandle<()>| !task.is_finished());
    }

    for task in connections {
        let _ = task.await;
    }
}

/// Declarations a connected client negotiated
struct ClientSession {
    id: Uuid,
    receive: Vec<ObjectDeclaration>,
}

async fn handle_connection(
    stream: TcpStream,
    world: Arc<World>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let connection = world.open_connection();
    let mut client = None;
    let result = run_connection(stream, &world, connection, &mut client, shutdown).await;

    world.release(connection);
    if let Some(session) = client {
        info!(client = %session.id, connection, "Client disconnected");
    }
    result
}

async fn run_connection(
    mut stream: TcpStream,
    world: &World,
    connection: ConnectionId,
    client: &mut Option<ClientSession>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut rx = BytesMut::with_capacity(8 * 1024);

    loop {
        while let Some((sequence, payload)) = decode_frame(&mut rx)? {
            let (reply, close) = respond(world, connection, client, &payload);
            if let Some(bytes) = reply {
                stream.write_all(&encode_frame(sequence, &bytes)?).await?;
            }
            if close {
                return Ok(());
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = stream.read_buf(&mut rx) => {
                if read? == 0 {
                    return Ok(());
                }
            }
        }
    }
}

/// Answer one request. Returns the encoded reply and whether to hang up.
fn respond(
    world: &World,
    connection: ConnectionId,
    client: &mut Option<ClientSession>,
    payload: &[u8],
) -> (Option<Vec<u8>>, bool) {
    let codec = WireCodec::new(read_header(payload).map(|h| h.format).unwrap_or_default());

    let (reply, close) = match codec.decode_message(payload) {
        Ok(Message::Handshake(handshake)) => {
            world.release(connection);
            world.release_client(handshake.client_id);

            let send = world.claim(handshake.client_id, connection, &handshake.send);
            let resume = world.read(&send);
            info!(
                client = %handshake.client_id,
                simulation = %handshake.meta.simulation_name,
                send = send.len(),
                receive = handshake.receive.len(),
                "Handshake"
            );

            *client = Some(ClientSession {
                id: handshake.client_id,
                receive: handshake.receive.clone(),
            });
            let ack = HandshakeAck {
                send,
                receive: handshake.receive,
                sim_time: world.sim_time(),
                resume,
            };
            (Message::HandshakeAck(ack), false)
        }
        Ok(Message::Exchange(exchange)) => match client.as_ref() {
            Some(session) => {
                world.apply(session.id, &exchange.objects);
                let update = Update {
                    sim_time: world.sim_time(),
                    objects: world.read(&session.receive),
                    api_results: exchange.api_calls.iter().map(|c| world.call(c)).collect(),
                };
                (Message::Update(update), false)
            }
            None => (
                Message::Reset {
                    reason: "no handshake on this connection".to_string(),
                },
                false,
            ),
        },
        Ok(Message::Close) => (Message::Close, true),
        Ok(other) => (
            Message::Reset {
                reason: format!("unexpected {} from client", other.name()),
            },
            false,
        ),
        Err(e) => {
            warn!(error = %e, "Undecodable request");
            (
                Message::Reset {
                    reason: e.to_string(),
                },
                false,
            )
        }
    };

    match codec.encode_message(&reply) {
        Ok(bytes) => (Some(bytes), close),
        Err(e) => {
            warn!(error = %e, "Failed to encode reply");
            (None, close)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Exchange, Handshake, SessionMeta, WireFormat};
    use crate::state::{ObjectKind, ObjectState};

    fn handshake(client_id: Uuid) -> Vec<u8> {
        WireCodec::new(WireFormat::Json)
            .encode_message(&Message::Handshake(Handshake {
                client_id,
                meta: SessionMeta::default(),
                send: vec![ObjectDeclaration::new("cup", ObjectKind::RigidBody, ["position"])],
                receive: vec![ObjectDeclaration::new("cup", ObjectKind::RigidBody, ["quaternion"])],
            }))
            .unwrap()
    }

    fn exchange() -> Vec<u8> {
        WireCodec::default()
            .encode_message(&Message::Exchange(Exchange {
                sim_time: 0.0,
                objects: vec![ObjectState::new("cup", ObjectKind::RigidBody).with("position", [1.0, 0.0, 0.0])],
                api_calls: Vec::new(),
            }))
            .unwrap()
    }

    fn decode(reply: Option<Vec<u8>>) -> Message {
        WireCodec::default().decode_message(&reply.unwrap()).unwrap()
    }

    #[test]
    fn test_exchange_before_handshake_resets() {
        let world = World::new();
        let mut client = None;

        let (reply, close) = respond(&world, 1, &mut client, &exchange());
        assert!(!close);
        assert!(matches!(decode(reply), Message::Reset { .. }));
    }

    #[test]
    fn test_reply_uses_request_format() {
        let world = World::new();
        let mut client = None;

        let (reply, _) = respond(&world, 1, &mut client, &handshake(Uuid::new_v4()));
        let reply = reply.unwrap();
        assert_eq!(read_header(&reply).unwrap().format, WireFormat::Json);
        assert!(matches!(
            WireCodec::default().decode_message(&reply).unwrap(),
            Message::HandshakeAck(_)
        ));
    }

    #[test]
    fn test_exchange_stores_and_returns_subscriptions() {
        let world = World::new();
        world.set("cup", ObjectKind::RigidBody, "quaternion", [1.0, 0.0, 0.0, 0.0]);
        let mut client = None;

        respond(&world, 1, &mut client, &handshake(Uuid::new_v4()));
        let Message::Update(update) = decode(respond(&world, 1, &mut client, &exchange()).0) else {
            panic!("expected update");
        };

        assert_eq!(update.objects.len(), 1);
        assert!(update.objects[0].get("quaternion").is_some());
        assert!(update.objects[0].get("position").is_none());
        assert!(world.get("cup").unwrap().get("position").is_some());
    }

    #[test]
    fn test_old_connection_ending_keeps_reconnected_claims() {
        let world = World::new();
        let client_id = Uuid::new_v4();
        let (old, new) = (world.open_connection(), world.open_connection());
        let (mut old_client, mut new_client) = (None, None);

        respond(&world, old, &mut old_client, &handshake(client_id));
        respond(&world, new, &mut new_client, &handshake(client_id));
        assert_eq!(world.owner("cup", "position"), Some(client_id));

        // What handle_connection does once the old socket finally closes
        world.release(old);
        assert_eq!(world.owner("cup", "position"), Some(client_id));

        let Message::Update(_) = decode(respond(&world, new, &mut new_client, &exchange()).0) else {
            panic!("expected update");
        };
        assert!(world.get("cup").unwrap().get("position").is_some());
    }

    #[test]
    fn test_close_hangs_up() {
        let world = World::new();
        let mut client = None;
        let close = WireCodec::default().encode_message(&Message::Close).unwrap();

        let (reply, hang_up) = respond(&world, 1, &mut client, &close);
        assert!(hang_up);
        assert_eq!(decode(reply), Message::Close);
    }
}
