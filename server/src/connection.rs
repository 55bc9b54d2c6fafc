use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use actix::{
    Actor, ActorContext, AsyncContext, Handler, Message, Recipient, Running, StreamHandler,
};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws::{self, CloseCode, CloseReason};
use tokio::sync::mpsc::{unbounded_channel, Receiver, UnboundedReceiver, UnboundedSender};

use system::{ConnectionId, DisconnectReason, SessionMessage, UserEvent};

use crate::server::{ServerCommand, ServerTx};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected {
        connection_id: ConnectionId,
        client_timeout: Duration,
    },
    Message(SessionMessage),
    Disconnected {
        reason: DisconnectReason,
    },
}

#[derive(Message)]
#[rtype(result = "()")]
struct ConnectionActorMessage(ConnectionEvent);

enum ConnectionState {
    Idle,
    Connected(ConnectionId),
}

struct ConnectionActor {
    state: ConnectionState,
    /// Commands for the server loop, forwarded in order by [`forward_to_server`].
    ingress: UnboundedSender<ServerCommand>,
    peer: IpAddr,
    heartbeat: Instant,
    /// Reported to the server when the actor stops.
    departure: UserEvent,
}

impl ConnectionActor {
    fn send_to_server(&self, command: ServerCommand) {
        if self.ingress.send(command).is_err() {
            log::error!("Cannot reach server from {}", self.peer);
        }
    }

    fn start_heartbeat(&self, client_timeout: Duration, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, move |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > client_timeout {
                log::info!("Client {} timed out", act.peer);
                act.departure = UserEvent::TimedOut;
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, rx) = tokio::sync::mpsc::channel::<ConnectionEvent>(256);

        self.send_to_server(ServerCommand::Connect {
            tx,
            peer: self.peer,
        });

        tokio::spawn(forward_to_actor(rx, ctx.address().recipient()));
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        if let ConnectionState::Connected(from) = self.state {
            self.send_to_server(ServerCommand::Disconnect {
                from,
                reason: self.departure,
            });
        }

        Running::Stop
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => self.heartbeat = Instant::now(),
            Ok(ws::Message::Binary(bin)) => {
                self.heartbeat = Instant::now();
                log::debug!("Ingress size: {}", bin.len());
                if let ConnectionState::Connected(from) = self.state {
                    match SessionMessage::decode(&bin) {
                        Ok(message) => {
                            log::debug!("Ingress {:?}", message.message.kind());
                            self.send_to_server(ServerCommand::Message { from, message });
                        }
                        Err(err) => log::warn!("Dropping frame from {}: {}", self.peer, err),
                    }
                }
            }
            Ok(ws::Message::Close(_)) => {
                self.departure = UserEvent::Disconnect;
                ctx.stop();
            }
            Ok(other) => log::debug!("Ignoring frame {:?} from {}", other, self.peer),
            Err(err) => {
                log::warn!("Protocol error from {}: {}", self.peer, err);
                self.departure = UserEvent::BrokenPipe;
                ctx.stop();
            }
        }
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(
        &mut self,
        msg: ConnectionActorMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Self::Result {
        match msg.0 {
            ConnectionEvent::Connected {
                connection_id,
                client_timeout,
            } => {
                log::debug!("Client {} is connection {}", self.peer, connection_id);
                self.state = ConnectionState::Connected(connection_id);
                self.start_heartbeat(client_timeout, ctx);
            }
            ConnectionEvent::Disconnected { reason } => {
                self.departure = UserEvent::Disconnect;
                ctx.close(Some(CloseReason {
                    code: CloseCode::Policy,
                    description: Some(reason.code().to_owned()),
                }));
                ctx.stop();
            }
            ConnectionEvent::Message(message) => match message.encode() {
                Ok(bytes) => ctx.binary(bytes),
                Err(err) => log::error!("Cannot encode {:?}: {}", message.message.kind(), err),
            },
        }
    }
}

/// Hands events from the server loop to the actor, waiting whenever its
/// mailbox is full.
async fn forward_to_actor(
    mut rx: Receiver<ConnectionEvent>,
    addr: Recipient<ConnectionActorMessage>,
) {
    log::debug!("connection green thread - started");
    while let Some(msg) = rx.recv().await {
        if addr.send(ConnectionActorMessage(msg)).await.is_err() {
            break;
        }
    }
    log::debug!("connection green thread - terminated");
}

/// Hands commands to the server loop in the order the actor issued them,
/// waiting whenever the server queue is full.
async fn forward_to_server(mut rx: UnboundedReceiver<ServerCommand>, srv_tx: ServerTx) {
    while let Some(command) = rx.recv().await {
        if srv_tx.send(command).await.is_err() {
            log::warn!("Server loop is gone");
            break;
        }
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    srv_tx: web::Data<ServerTx>,
) -> Result<HttpResponse, Error> {
    let peer = req
        .peer_addr()
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let (ingress, ingress_rx) = unbounded_channel();
    tokio::spawn(forward_to_server(ingress_rx, srv_tx.get_ref().clone()));
    ws::start(
        ConnectionActor {
            ingress,
            state: ConnectionState::Idle,
            peer,
            heartbeat: Instant::now(),
            departure: UserEvent::BrokenPipe,
        },
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix::Context;
    use tokio::sync::mpsc::channel;

    fn stroke(x: i16) -> SessionMessage {
        SessionMessage::new(
            1,
            system::Message::StrokeInfo(system::StrokeInfo {
                user: 1,
                x,
                y: 0,
                pressure: 1,
            }),
        )
    }

    struct Recorder(UnboundedSender<ConnectionEvent>);

    impl Actor for Recorder {
        type Context = Context<Self>;
    }

    impl Handler<ConnectionActorMessage> for Recorder {
        type Result = ();

        fn handle(&mut self, msg: ConnectionActorMessage, _: &mut Context<Self>) {
            self.0.send(msg.0).unwrap();
        }
    }

    #[actix_web::test]
    async fn a_burst_larger_than_the_mailbox_reaches_the_actor() {
        let (seen_tx, mut seen_rx) = unbounded_channel();
        let addr = Recorder(seen_tx).start();

        let (tx, rx) = channel(256);
        for x in 0..100 {
            tx.send(ConnectionEvent::Message(stroke(x))).await.unwrap();
        }
        drop(tx);
        forward_to_actor(rx, addr.recipient()).await;

        for x in 0..100 {
            match seen_rx.recv().await {
                Some(ConnectionEvent::Message(message)) => assert_eq!(message, stroke(x)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn ingress_waits_for_room_in_the_server_queue() {
        let (srv_tx, mut srv_rx) = channel(1);
        let (ingress, ingress_rx) = unbounded_channel();
        for x in 0..50 {
            ingress
                .send(ServerCommand::Message {
                    from: 1,
                    message: stroke(x),
                })
                .unwrap();
        }
        ingress
            .send(ServerCommand::Disconnect {
                from: 1,
                reason: UserEvent::BrokenPipe,
            })
            .unwrap();
        drop(ingress);
        let forwarder = tokio::spawn(forward_to_server(ingress_rx, srv_tx));

        for x in 0..50 {
            match srv_rx.recv().await {
                Some(ServerCommand::Message { message, .. }) => assert_eq!(message, stroke(x)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            srv_rx.recv().await,
            Some(ServerCommand::Disconnect {
                from: 1,
                reason: UserEvent::BrokenPipe
            })
        ));
        forwarder.await.unwrap();
    }
}
