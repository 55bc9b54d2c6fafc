use std::collections::BTreeMap;
use std::sync::Arc;

use easel_server::ban::BanList;
use easel_server::config::ServerSettings;
use easel_server::server::{Admission, ListenTarget, Server, ServerOptions};
use easel_server::session::Outgoing;
use easel_server::snapshot::{FixedSnapshot, MemberUpload, SnapshotProvider};
use system::{
    ConnectionId, Message, Notification, SessionMessage, SessionMode, SessionState, StrokeInfo,
    UserEvent,
};

const SNAPSHOT: &[u8] = b"0123456789";

struct Client {
    name: String,
    state: Option<SessionState>,
    /// Base image plus every stroke applied on top of it, two bytes per point.
    canvas: Vec<u8>,
    notifications: Vec<Notification>,
    inbox: Vec<SessionMessage>,
}

struct Network {
    server: Server,
    clients: BTreeMap<ConnectionId, Client>,
}

impl Network {
    fn new() -> Self {
        Self::with_snapshots(Arc::new(FixedSnapshot(SNAPSHOT.to_vec())))
    }

    fn with_snapshots(snapshots: Arc<dyn SnapshotProvider>) -> Self {
        let mut server = Server::new(
            ServerOptions::default(),
            ServerSettings::default(),
            Box::new(BanList::new()),
            snapshots,
        );
        server.registry_mut().set_chunk_size(4);
        server
            .start(ListenTarget::Address("127.0.0.1:0".parse().unwrap()))
            .unwrap();
        Self {
            server,
            clients: BTreeMap::new(),
        }
    }

    fn connect(&mut self, name: &str) -> ConnectionId {
        let id = match self.server.connect("127.0.0.1".parse().unwrap()) {
            Admission::Accepted(id) => id,
            other => panic!("rejected: {:?}", other),
        };
        self.clients.insert(
            id,
            Client {
                name: name.into(),
                state: None,
                canvas: Vec::new(),
                notifications: Vec::new(),
                inbox: Vec::new(),
            },
        );
        id
    }

    fn client(&mut self, id: ConnectionId) -> &mut Client {
        self.clients.get_mut(&id).unwrap()
    }

    fn state(&mut self, id: ConnectionId) -> &mut SessionState {
        self.client(id).state.as_mut().unwrap()
    }

    /// Moves everything the server has queued into client inboxes.
    fn server_to_clients(&mut self) -> bool {
        let outgoing = self.server.take_outgoing();
        let any = !outgoing.is_empty();
        for item in outgoing {
            if let Outgoing::Send { to, message } = item {
                if let Some(client) = self.clients.get_mut(&to) {
                    client.inbox.push(message);
                }
            }
        }
        any
    }

    /// Lets every client process its inbox.
    fn clients_receive(&mut self) {
        for client in self.clients.values_mut() {
            for message in client.inbox.drain(..) {
                match message.message {
                    Message::Joined { user, session } => {
                        client.state = Some(SessionState::new(user, &client.name, session));
                    }
                    other => {
                        let state = client.state.as_mut().unwrap();
                        state.handle_message(other).unwrap();
                        let notifications = state.consume_notifications();
                        for notification in &notifications {
                            match notification {
                                Notification::RasterReceived(100) => {
                                    client.canvas = state.session_image().unwrap().to_vec();
                                }
                                Notification::StrokeReceived(point) => {
                                    client.canvas.extend_from_slice(&[point.x as u8, point.y as u8]);
                                }
                                Notification::UploadRequested => {
                                    state.send_raster(client.canvas.clone()).unwrap();
                                }
                                _ => {}
                            }
                        }
                        client.notifications.extend(notifications);
                    }
                }
            }
        }
    }

    /// Delivers whatever the clients queued to the server, in connection order.
    fn clients_to_server(&mut self) -> bool {
        let mut queued = Vec::new();
        for (&id, client) in self.clients.iter_mut() {
            if let Some(state) = client.state.as_mut() {
                for message in state.consume_outgoing() {
                    queued.push((id, message));
                }
            }
        }
        let any = !queued.is_empty();
        for (id, message) in queued {
            self.server.handle_message(id, message);
        }
        any
    }

    fn step(&mut self) -> bool {
        let sent = self.server_to_clients();
        self.clients_receive();
        let replied = self.clients_to_server();
        sent || replied
    }

    fn settle(&mut self) {
        while self.step() {}
    }

    fn strokes_seen(&self, id: ConnectionId) -> Vec<StrokeInfo> {
        self.clients[&id]
            .notifications
            .iter()
            .filter_map(|n| match n {
                Notification::StrokeReceived(point) => Some(*point),
                _ => None,
            })
            .collect()
    }
}

fn host(net: &mut Network, id: ConnectionId, name: &str) -> system::SessionId {
    net.server.handle_message(
        id,
        SessionMessage::new(
            0,
            Message::Host {
                name: name.into(),
                alias: None,
                width: 64,
                height: 64,
                user_limit: 5,
                mode: SessionMode::default(),
            },
        ),
    );
    net.settle();
    net.state(id).info().id
}

fn join(session: system::SessionId, name: &str) -> SessionMessage {
    SessionMessage::new(
        session,
        Message::UserInfo {
            event: UserEvent::Join,
            user: 0,
            name: name.into(),
            locked: false,
        },
    )
}

#[test]
fn late_joiner_sees_the_same_history() {
    let mut net = Network::new();

    let alice = net.connect("alice");
    net.server.handle_message(
        alice,
        SessionMessage::new(
            0,
            Message::Host {
                name: "alice".into(),
                alias: Some("jam".into()),
                width: 64,
                height: 64,
                user_limit: 5,
                mode: SessionMode::default(),
            },
        ),
    );
    net.settle();
    let session = net.state(alice).info().id;
    assert_eq!(net.state(alice).session_image(), Some(SNAPSHOT));

    let bob = net.connect("bob");
    net.server.handle_message(bob, join(session, "bob"));
    net.settle();
    assert!(!net.state(bob).is_buffering());

    let carol = net.connect("carol");
    net.server.handle_message(carol, join(session, "carol"));
    // Synchronize reaches alice and bob, they acknowledge, the first chunk goes out.
    net.step();
    net.server_to_clients();
    net.clients_receive();
    assert_eq!(net.state(carol).session_image(), None);
    assert!(net.state(carol).is_buffering());

    // Two points are drawn between the first and second chunk.
    net.state(alice).send_stroke_info(1, 1, 100).unwrap();
    net.state(bob).send_stroke_info(2, 2, 200).unwrap();
    net.clients_to_server();
    net.server_to_clients();
    net.clients_receive();
    assert_eq!(net.state(carol).buffered_operations(), 2);
    assert!(net.strokes_seen(carol).is_empty());

    net.settle();
    assert_eq!(net.state(carol).session_image(), Some(SNAPSHOT));
    assert!(!net.state(carol).is_buffering());

    let expected = vec![
        StrokeInfo {
            user: 1,
            x: 1,
            y: 1,
            pressure: 100,
        },
        StrokeInfo {
            user: 2,
            x: 2,
            y: 2,
            pressure: 200,
        },
    ];
    assert_eq!(net.strokes_seen(alice), expected);
    assert_eq!(net.strokes_seen(bob), expected);
    assert_eq!(net.strokes_seen(carol), expected);

    // The flush happened after the last chunk, never before it.
    let carol_notifications = &net.clients[&carol].notifications;
    let complete = carol_notifications
        .iter()
        .position(|n| *n == Notification::RasterReceived(100))
        .unwrap();
    let first_stroke = carol_notifications
        .iter()
        .position(|n| matches!(n, Notification::StrokeReceived(_)))
        .unwrap();
    assert!(complete < first_stroke);
}

#[test]
fn joiner_leaving_mid_transfer_does_not_disturb_others() {
    let mut net = Network::new();
    let alice = net.connect("alice");
    net.server.handle_message(
        alice,
        SessionMessage::new(
            0,
            Message::Host {
                name: "alice".into(),
                alias: None,
                width: 64,
                height: 64,
                user_limit: 5,
                mode: SessionMode::default(),
            },
        ),
    );
    net.settle();
    let session = net.state(alice).info().id;

    let carol = net.connect("carol");
    net.server.handle_message(carol, join(session, "carol"));
    net.step();
    net.step();
    net.server.disconnect(carol, UserEvent::BrokenPipe);
    net.clients.remove(&carol);
    net.settle();

    assert!(!net.state(alice).is_sync_waiting());
    net.state(alice).send_stroke_info(3, 4, 50).unwrap();
    net.settle();
    assert_eq!(net.strokes_seen(alice).len(), 1);
    assert!(net
        .clients[&alice]
        .notifications
        .iter()
        .any(|n| matches!(n, Notification::UserLeft(2, UserEvent::BrokenPipe))));
}

#[test]
fn joiner_gets_the_canvas_uploaded_by_the_owner() {
    let mut net = Network::with_snapshots(Arc::new(MemberUpload));
    let alice = net.connect("alice");
    let session = host(&mut net, alice, "alice");
    assert_eq!(net.state(alice).session_image(), Some(&[][..]));

    let bob = net.connect("bob");
    net.server.handle_message(bob, join(session, "bob"));
    net.settle();
    assert!(!net.state(bob).is_buffering());
    assert_eq!(net.state(bob).session_image(), Some(&[][..]));

    net.state(alice).send_stroke_info(1, 2, 10).unwrap();
    net.state(bob).send_stroke_info(3, 4, 10).unwrap();
    net.state(bob).send_stroke_end();
    net.settle();

    // alice is mid-stroke, so the capture waits for her
    let carol = net.connect("carol");
    net.server.handle_message(carol, join(session, "carol"));
    net.settle();
    assert_eq!(net.state(carol).session_image(), None);

    net.state(alice).send_stroke_info(5, 6, 10).unwrap();
    net.state(alice).send_stroke_end();
    net.settle();

    assert_eq!(net.state(carol).session_image(), Some(&[1, 2, 3, 4, 5, 6][..]));
    assert!(!net.state(carol).is_buffering());
    assert!(!net.state(alice).is_uploading());
    assert!(!net.state(alice).is_sync_waiting());
    assert!(!net.state(bob).is_sync_waiting());
    assert!(net.clients[&alice]
        .notifications
        .contains(&Notification::UploadRequested));
    assert!(!net.clients[&bob]
        .notifications
        .contains(&Notification::UploadRequested));

    net.state(bob).send_stroke_info(7, 8, 10).unwrap();
    net.state(bob).send_stroke_end();
    net.settle();

    let expected: Vec<u8> = (1..=8).collect();
    for id in [alice, bob, carol] {
        assert_eq!(net.clients[&id].canvas, expected);
    }
}
