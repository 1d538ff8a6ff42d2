//! HTTP polling fallback
//!
//! For clients that cannot keep a socket open. `GET /polling` refreshes the
//! caller, returns the fresh part of the room directory and drains the
//! caller's mailbox. `POST /polling` drops messages into other mailboxes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rouille::{Request, Response, Server};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PollingConfig;
use crate::model::client::{ClientRecord, Identity};
use crate::model::message::{ClientEntry, OutgoingMessage, RelayedMessage};
use crate::{Error, Result};

pub const POLLING_PATH: &str = "/polling";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSnapshot {
    pub clients: Vec<ClientEntry>,
    pub messages: Vec<RelayedMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingPost {
    pub messages: Vec<OutgoingMessage>,
}

#[derive(Default)]
struct PollingRoom {
    clients: HashMap<String, ClientRecord>,
    mailboxes: HashMap<String, Vec<RelayedMessage>>,
}

pub struct PollingServer {
    config: PollingConfig,
    rooms: Mutex<HashMap<String, PollingRoom>>,
}

/// A polling server running on its own thread.
pub struct PollingHandle {
    pub addr: SocketAddr,
    stop: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl PollingHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.thread.join();
    }
}

impl PollingServer {
    pub fn new(config: PollingConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Serve on `bind_addr` from the configuration, blocking the thread.
    pub fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.config.bind_addr;
        let server = Server::new(addr, move |request| self.handle(request))
            .map_err(|e| Error::network(format!("starting the polling server: {}", e)))?;
        info!("Polling endpoint on http://{}{}", server.server_addr(), POLLING_PATH);
        server.run();
        Ok(())
    }

    /// Serve on `addr` from a background thread.
    pub fn spawn(self: Arc<Self>, addr: SocketAddr) -> Result<PollingHandle> {
        let server = Server::new(addr, move |request| self.handle(request))
            .map_err(|e| Error::network(format!("starting the polling server: {}", e)))?;
        let addr = server.server_addr();
        let (thread, stop) = server.stoppable();
        Ok(PollingHandle { addr, stop, thread })
    }

    pub fn handle(&self, request: &Request) -> Response {
        if request.url().trim_end_matches('/') != POLLING_PATH {
            return Response::empty_404();
        }
        let identity = match Identity::from_query(request.raw_query_string()) {
            Ok(identity) => identity,
            Err(e) => {
                info!("Rejected poll: {}", e);
                return Response::text("missing_arguments").with_status_code(400);
            }
        };
        if let Err(e) = self.authorize(&identity) {
            info!("Rejected poll: {}", e);
            return Response::text("authentication_mismatched").with_status_code(403);
        }

        match request.method() {
            "GET" => Response::json(&self.poll(&identity)),
            "POST" => {
                let post: PollingPost = match rouille::input::json_input(request) {
                    Ok(post) => post,
                    Err(e) => {
                        debug!("Bad poll body from {}: {}", identity.client_id, e);
                        return Response::text("invalid_body").with_status_code(400);
                    }
                };
                self.enqueue(&identity, post.messages);
                Response::text("OK")
            }
            _ => Response::text("method_not_allowed").with_status_code(405),
        }
    }

    /// A registration only reserves its client id while it is fresh.
    fn authorize(&self, identity: &Identity) -> Result<()> {
        let rooms = self.rooms.lock();
        let record = rooms
            .get(&identity.room_id)
            .and_then(|room| room.clients.get(&identity.client_id));
        match record {
            Some(record)
                if record.is_fresh(self.config.client_ttl)
                    && !record.authenticates(&identity.secret) =>
            {
                Err(Error::AuthenticationMismatch(identity.client_id.clone()))
            }
            _ => Ok(()),
        }
    }

    fn poll(&self, identity: &Identity) -> PollingSnapshot {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(identity.room_id.clone()).or_default();
        room.clients.insert(
            identity.client_id.clone(),
            ClientRecord::new(&identity.client_id, &identity.secret),
        );

        let ttl = self.config.client_ttl;
        room.clients.retain(|_, record| record.is_fresh(ttl));
        let mut clients: Vec<ClientEntry> = room
            .clients
            .keys()
            .map(|client_id| ClientEntry {
                client_id: client_id.clone(),
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let messages = room
            .mailboxes
            .remove(&identity.client_id)
            .unwrap_or_default();
        PollingSnapshot { clients, messages }
    }

    fn enqueue(&self, identity: &Identity, messages: Vec<OutgoingMessage>) {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(identity.room_id.clone()).or_default();
        if let Some(record) = room.clients.get_mut(&identity.client_id) {
            record.touch();
        }
        for message in messages {
            room.mailboxes
                .entry(message.target_client_id)
                .or_default()
                .push(RelayedMessage {
                    source_client_id: identity.client_id.clone(),
                    payload: message.payload,
                });
        }
    }
}

/// Client side of the polling endpoint.
pub struct PollingClient {
    http: reqwest::Client,
    url: String,
}

impl PollingClient {
    /// `endpoint` is the full polling URL, e.g. `http://host:8789/polling`.
    pub fn new(endpoint: &str, identity: &Identity) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}?{}", endpoint, identity_query(identity)),
        }
    }

    pub async fn poll(&self) -> Result<PollingSnapshot> {
        let res = check_status(self.http.get(&self.url).send().await?)?;
        Ok(res.json().await?)
    }

    pub async fn post(&self, messages: Vec<OutgoingMessage>) -> Result<()> {
        let res = self
            .http
            .post(&self.url)
            .json(&PollingPost { messages })
            .send()
            .await?;
        check_status(res)?;
        Ok(())
    }
}

fn identity_query(identity: &Identity) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("roomId", &identity.room_id)
        .append_pair("clientId", &identity.client_id)
        .append_pair("secret", &identity.secret)
        .finish()
}

fn check_status(res: reqwest::Response) -> Result<reqwest::Response> {
    match res.status() {
        reqwest::StatusCode::BAD_REQUEST => Err(Error::MissingArgument("roomId, clientId or secret")),
        reqwest::StatusCode::FORBIDDEN => Err(Error::AuthenticationMismatch(
            res.url()
                .query_pairs()
                .find(|(k, _)| k == "clientId")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default(),
        )),
        _ => Ok(res.error_for_status()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use std::time::Duration;

    fn body(res: Response) -> String {
        let (mut reader, _) = res.data.into_reader_and_size();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        out
    }

    fn get(server: &PollingServer, query: &str) -> Response {
        let req = Request::fake_http("GET", format!("/polling?{}", query), vec![], vec![]);
        server.handle(&req)
    }

    fn post(server: &PollingServer, query: &str, payload: serde_json::Value) -> Response {
        let req = Request::fake_http(
            "POST",
            format!("/polling?{}", query),
            vec![("Content-Type".to_owned(), "application/json".to_owned())],
            serde_json::to_vec(&payload).unwrap(),
        );
        server.handle(&req)
    }

    #[test]
    fn test_rejects_missing_arguments() {
        let server = PollingServer::new(PollingConfig::default());
        let res = get(&server, "roomId=r1&clientId=c1");
        assert_eq!(res.status_code, 400);
        assert_eq!(body(res), "missing_arguments");
    }

    #[test]
    fn test_rejects_secret_mismatch() {
        let server = PollingServer::new(PollingConfig::default());
        assert_eq!(get(&server, "roomId=r1&clientId=c1&secret=a").status_code, 200);
        let res = get(&server, "roomId=r1&clientId=c1&secret=b");
        assert_eq!(res.status_code, 403);
        assert_eq!(body(res), "authentication_mismatched");
    }

    #[test]
    fn test_post_then_poll_drains_mailbox() {
        let server = PollingServer::new(PollingConfig::default());
        get(&server, "roomId=r1&clientId=c1&secret=a");
        get(&server, "roomId=r1&clientId=c2&secret=b");

        let res = post(
            &server,
            "roomId=r1&clientId=c1&secret=a",
            json!({"messages": [{"targetClientId": "c2", "payload": {"type": "offer", "sdp": "v=0"}}]}),
        );
        assert_eq!(res.status_code, 200);

        let snapshot: PollingSnapshot =
            serde_json::from_str(&body(get(&server, "roomId=r1&clientId=c2&secret=b"))).unwrap();
        let ids: Vec<&str> = snapshot.clients.iter().map(|c| c.client_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].source_client_id, "c1");
        assert_eq!(snapshot.messages[0].payload["sdp"], "v=0");

        let again: PollingSnapshot =
            serde_json::from_str(&body(get(&server, "roomId=r1&clientId=c2&secret=b"))).unwrap();
        assert!(again.messages.is_empty());
    }

    #[test]
    fn test_stale_clients_leave_the_directory() {
        let server = PollingServer::new(PollingConfig {
            client_ttl: Duration::from_millis(50),
            ..Default::default()
        });
        get(&server, "roomId=r1&clientId=c1&secret=a");
        std::thread::sleep(Duration::from_millis(100));

        let snapshot: PollingSnapshot =
            serde_json::from_str(&body(get(&server, "roomId=r1&clientId=c2&secret=b"))).unwrap();
        assert_eq!(snapshot.clients, vec![ClientEntry { client_id: "c2".into() }]);
        // an expired registration no longer holds the id
        assert_eq!(get(&server, "roomId=r1&clientId=c1&secret=z").status_code, 200);
    }

    #[tokio::test]
    async fn test_client_against_running_server() {
        let handle = PollingServer::new(PollingConfig::default())
            .spawn("127.0.0.1:0".parse().unwrap())
            .unwrap();
        let endpoint = format!("http://{}{}", handle.addr, POLLING_PATH);

        let alice = PollingClient::new(&endpoint, &Identity::new("r1", "alice", "a"));
        let bob = PollingClient::new(&endpoint, &Identity::new("r1", "bob", "b"));
        alice.poll().await.unwrap();
        bob.poll().await.unwrap();
        alice
            .post(vec![OutgoingMessage {
                target_client_id: "bob".into(),
                payload: json!("hi"),
            }])
            .await
            .unwrap();

        let snapshot = bob.poll().await.unwrap();
        assert_eq!(snapshot.clients.len(), 2);
        assert_eq!(snapshot.messages[0].payload, json!("hi"));

        let impostor = PollingClient::new(&endpoint, &Identity::new("r1", "bob", "x"));
        assert!(matches!(
            impostor.poll().await,
            Err(Error::AuthenticationMismatch(id)) if id == "bob"
        ));

        handle.stop();
    }
}
