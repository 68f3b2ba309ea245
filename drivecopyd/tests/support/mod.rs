//! In-memory drive served over HTTP for end-to-end runs.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use drivecopy_core::{Backoff, CredentialError, Credentials, DriveClient, RobustHttp};
use drivecopyd::sync::cursor::cmp_names;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use url::Url;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const ROOT: &str = "root";

pub struct FixedToken;

#[async_trait]
impl Credentials for FixedToken {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        Ok("test-token".into())
    }

    async fn invalidate(&self) -> Result<(), CredentialError> {
        Ok(())
    }
}

pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(1), Duration::from_millis(2), false)
}

pub fn drive_client(server: &MockServer, page_size: u32) -> DriveClient {
    let http = RobustHttp::with_client(reqwest::Client::new(), Arc::new(FixedToken))
        .with_backoff(fast_backoff());
    DriveClient::with_base_url(&server.uri(), http)
        .unwrap()
        .with_page_size(page_size)
}

pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut hex = format!("{digest:x}");
    hex.truncate(16);
    hex
}

/// Deterministic content of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[derive(Debug, Clone)]
enum Kind {
    Folder,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    drive: String,
    parent: Option<String>,
    name: String,
    kind: Kind,
}

impl Node {
    fn to_json(&self) -> Value {
        match &self.kind {
            Kind::Folder => json!({
                "id": self.id,
                "name": self.name,
                "folder": { "childCount": 0 },
            }),
            Kind::File(content) => json!({
                "id": self.id,
                "name": self.name,
                "size": content.len(),
                "file": { "hashes": { "quickXorHash": content_hash(content) } },
            }),
        }
    }
}

struct Session {
    drive: String,
    parent: String,
    name: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    base: String,
    next_id: u64,
    nodes: HashMap<(String, String), Node>,
    sessions: HashMap<u64, Session>,
    lost_chunk_responses: HashSet<u64>,
    chunk_starts: Vec<u64>,
}

enum Target {
    Item(String),
    Child { parent: String, name: String },
}

fn error(status: u16, code: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({ "error": { "code": code } }))
}

impl State {
    fn key(drive: &str, id: &str) -> (String, String) {
        (drive.to_string(), id.to_string())
    }

    fn ensure_root(&mut self, drive: &str) {
        self.nodes
            .entry(Self::key(drive, ROOT))
            .or_insert_with(|| Node {
                id: ROOT.into(),
                drive: drive.into(),
                parent: None,
                name: String::new(),
                kind: Kind::Folder,
            });
    }

    fn is_folder(&self, drive: &str, id: &str) -> bool {
        self.nodes
            .get(&Self::key(drive, id))
            .is_some_and(|node| matches!(node.kind, Kind::Folder))
    }

    fn children(&self, drive: &str, parent: &str) -> Vec<&Node> {
        let mut children: Vec<&Node> = self
            .nodes
            .values()
            .filter(|node| node.drive == drive && node.parent.as_deref() == Some(parent))
            .collect();
        children.sort_by(|left, right| cmp_names(&left.name, &right.name));
        children
    }

    fn child(&self, drive: &str, parent: &str, name: &str) -> Option<&Node> {
        self.children(drive, parent)
            .into_iter()
            .find(|node| node.name == name)
    }

    fn insert(&mut self, drive: &str, parent: &str, name: &str, kind: Kind) -> Node {
        self.ensure_root(drive);
        if let Some(existing) = self.child(drive, parent, name).map(|node| node.id.clone()) {
            let node = self
                .nodes
                .get_mut(&Self::key(drive, &existing))
                .unwrap();
            node.kind = kind;
            return node.clone();
        }
        self.next_id += 1;
        let node = Node {
            id: format!("item-{}", self.next_id),
            drive: drive.into(),
            parent: Some(parent.into()),
            name: name.into(),
            kind,
        };
        self.nodes
            .insert(Self::key(drive, &node.id), node.clone());
        node
    }

    fn remove(&mut self, drive: &str, id: &str) -> bool {
        let Some(node) = self.nodes.remove(&Self::key(drive, id)) else {
            return false;
        };
        let children: Vec<String> = self
            .children(drive, &node.id)
            .into_iter()
            .map(|child| child.id.clone())
            .collect();
        for child in children {
            self.remove(drive, &child);
        }
        true
    }

    fn handle(&mut self, request: &Request) -> ResponseTemplate {
        let segments: Vec<String> = request
            .url
            .path_segments()
            .map(|segments| segments.map(str::to_string).collect())
            .unwrap_or_default();
        let method = request.method.as_str();

        if segments.first().map(String::as_str) == Some("upload") {
            let Some(id) = segments.get(1).and_then(|id| id.parse::<u64>().ok()) else {
                return error(404, "itemNotFound");
            };
            return match method {
                "GET" => self.session_status(id),
                "PUT" => self.session_put(id, request),
                _ => error(405, "notSupported"),
            };
        }

        if segments.len() < 3 || segments[0] != "drives" {
            return error(404, "itemNotFound");
        }
        let drive = segments[1].clone();
        self.ensure_root(&drive);

        let trim = |segment: &String| segment.trim_end_matches(':').to_string();
        let (target, rest) = match segments[2].as_str() {
            "root" => (Target::Item(ROOT.into()), &segments[3..]),
            "root:" if segments.len() > 3 => (
                Target::Child {
                    parent: ROOT.into(),
                    name: trim(&segments[3]),
                },
                &segments[4..],
            ),
            "items" if segments.len() > 3 && segments[3].ends_with(':') && segments.len() > 4 => (
                Target::Child {
                    parent: trim(&segments[3]),
                    name: trim(&segments[4]),
                },
                &segments[5..],
            ),
            "items" if segments.len() > 3 => (Target::Item(segments[3].clone()), &segments[4..]),
            _ => return error(400, "invalidRequest"),
        };
        let rest: Vec<&str> = rest.iter().map(String::as_str).collect();

        match (method, target, rest.as_slice()) {
            ("GET", Target::Item(id), ["children"]) => self.list(&drive, &id, &request.url),
            ("POST", Target::Item(id), ["children"]) => self.create_folder(&drive, &id, request),
            ("GET", Target::Item(id), ["content"]) => self.content(&drive, &id, request),
            ("GET", Target::Item(id), []) => match self.nodes.get(&Self::key(&drive, &id)) {
                Some(node) => ResponseTemplate::new(200).set_body_json(node.to_json()),
                None => error(404, "itemNotFound"),
            },
            ("DELETE", Target::Item(id), []) => {
                if self.remove(&drive, &id) {
                    ResponseTemplate::new(204)
                } else {
                    error(404, "itemNotFound")
                }
            }
            ("GET", Target::Child { parent, name }, []) => {
                match self.child(&drive, &parent, &name) {
                    Some(node) => ResponseTemplate::new(200).set_body_json(node.to_json()),
                    None => error(404, "itemNotFound"),
                }
            }
            ("PUT", Target::Child { parent, name }, ["content"]) => {
                if !self.is_folder(&drive, &parent) {
                    return error(404, "itemNotFound");
                }
                let node = self.insert(&drive, &parent, &name, Kind::File(request.body.clone()));
                ResponseTemplate::new(201).set_body_json(node.to_json())
            }
            ("POST", Target::Child { parent, name }, ["createUploadSession"]) => {
                if !self.is_folder(&drive, &parent) {
                    return error(404, "itemNotFound");
                }
                self.next_id += 1;
                let id = self.next_id;
                self.sessions.insert(
                    id,
                    Session {
                        drive,
                        parent,
                        name,
                        data: Vec::new(),
                    },
                );
                ResponseTemplate::new(200).set_body_json(json!({
                    "uploadUrl": format!("{}/upload/{id}", self.base),
                    "expirationDateTime": "2030-01-01T00:00:00Z",
                }))
            }
            _ => error(400, "invalidRequest"),
        }
    }

    fn list(&self, drive: &str, parent: &str, url: &Url) -> ResponseTemplate {
        if !self.is_folder(drive, parent) {
            return error(404, "itemNotFound");
        }
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let top = query
            .get("$top")
            .and_then(|top| top.parse::<usize>().ok())
            .unwrap_or(200)
            .max(1);
        let skip = query
            .get("$skiptoken")
            .and_then(|skip| skip.parse::<usize>().ok())
            .unwrap_or(0);

        let children = self.children(drive, parent);
        let page: Vec<Value> = children
            .iter()
            .skip(skip)
            .take(top)
            .map(|node| node.to_json())
            .collect();
        let mut body = json!({ "value": page });
        if skip + top < children.len() {
            let mut next = Url::parse(&format!("{}{}", self.base, url.path())).unwrap();
            next.query_pairs_mut()
                .clear()
                .extend_pairs(query.iter().filter(|(key, _)| key.as_str() != "$skiptoken"))
                .append_pair("$skiptoken", &(skip + top).to_string());
            body["@odata.nextLink"] = Value::String(next.to_string());
        }
        ResponseTemplate::new(200).set_body_json(body)
    }

    fn create_folder(&mut self, drive: &str, parent: &str, request: &Request) -> ResponseTemplate {
        if !self.is_folder(drive, parent) {
            return error(404, "itemNotFound");
        }
        let Some(name) = serde_json::from_slice::<Value>(&request.body)
            .ok()
            .and_then(|body| body["name"].as_str().map(str::to_string))
        else {
            return error(400, "invalidRequest");
        };
        if self.child(drive, parent, &name).is_some() {
            return error(409, "nameAlreadyExists");
        }
        let node = self.insert(drive, parent, &name, Kind::Folder);
        ResponseTemplate::new(201).set_body_json(node.to_json())
    }

    fn content(&self, drive: &str, id: &str, request: &Request) -> ResponseTemplate {
        let Some(Kind::File(content)) = self
            .nodes
            .get(&Self::key(drive, id))
            .map(|node| &node.kind)
        else {
            return error(404, "itemNotFound");
        };
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.split_once('-'))
            .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));
        match range {
            Some((start, end)) if start < content.len() => {
                let end = end.min(content.len() - 1);
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {start}-{end}/{}", content.len()).as_str(),
                    )
                    .set_body_bytes(content[start..=end].to_vec())
            }
            Some(_) => error(416, "invalidRange"),
            None => ResponseTemplate::new(200).set_body_bytes(content.clone()),
        }
    }

    fn session_status(&self, id: u64) -> ResponseTemplate {
        match self.sessions.get(&id) {
            Some(session) => ResponseTemplate::new(200).set_body_json(json!({
                "nextExpectedRanges": [format!("{}-", session.data.len())],
            })),
            None => error(404, "itemNotFound"),
        }
    }

    fn session_put(&mut self, id: u64, request: &Request) -> ResponseTemplate {
        let Some((start, total)) = request
            .headers
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes "))
            .and_then(|value| value.split_once('/'))
            .and_then(|(range, total)| {
                let (start, _) = range.split_once('-')?;
                Some((start.parse::<usize>().ok()?, total.parse::<usize>().ok()?))
            })
        else {
            return error(400, "invalidRequest");
        };
        let Some(session) = self.sessions.get_mut(&id) else {
            return error(404, "itemNotFound");
        };
        if start != session.data.len() {
            return error(416, "invalidRange");
        }
        session.data.extend_from_slice(&request.body);
        self.chunk_starts.push(start as u64);
        let received = session.data.len();

        if received >= total {
            let Some(session) = self.sessions.remove(&id) else {
                return error(404, "itemNotFound");
            };
            let node = self.insert(
                &session.drive,
                &session.parent,
                &session.name,
                Kind::File(session.data),
            );
            return ResponseTemplate::new(201).set_body_json(node.to_json());
        }
        if self.lost_chunk_responses.remove(&(start as u64)) {
            // Stored, but the client never learns it.
            return error(400, "connectionReset");
        }
        ResponseTemplate::new(202).set_body_json(json!({
            "nextExpectedRanges": [format!("{received}-{}", total - 1)],
        }))
    }
}

/// Two-drive fake reachable through a `MockServer`.
#[derive(Clone)]
pub struct FakeDrive {
    state: Arc<Mutex<State>>,
}

impl Respond for FakeDrive {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.state.lock().unwrap().handle(request)
    }
}

impl FakeDrive {
    pub async fn start() -> (MockServer, FakeDrive) {
        let server = MockServer::start().await;
        let drive = FakeDrive {
            state: Arc::new(Mutex::new(State {
                base: server.uri(),
                ..State::default()
            })),
        };
        Mock::given(any())
            .respond_with(drive.clone())
            .mount(&server)
            .await;
        (server, drive)
    }

    pub fn add_folder(&self, drive: &str, parent: &str, name: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .insert(drive, parent, name, Kind::Folder)
            .id
    }

    pub fn add_file(&self, drive: &str, parent: &str, name: &str, content: &[u8]) -> String {
        self.state
            .lock()
            .unwrap()
            .insert(drive, parent, name, Kind::File(content.to_vec()))
            .id
    }

    /// Resolves a `/`-separated path below the drive root to an item id.
    pub fn resolve(&self, drive: &str, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let mut current = ROOT.to_string();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current = state.child(drive, &current, part)?.id.clone();
        }
        Some(current)
    }

    pub fn is_folder(&self, drive: &str, path: &str) -> bool {
        self.resolve(drive, path)
            .is_some_and(|id| self.state.lock().unwrap().is_folder(drive, &id))
    }

    pub fn content(&self, drive: &str, path: &str) -> Option<Vec<u8>> {
        let id = self.resolve(drive, path)?;
        match &self.state.lock().unwrap().nodes.get(&State::key(drive, &id))?.kind {
            Kind::File(content) => Some(content.clone()),
            Kind::Folder => None,
        }
    }

    pub fn child_names(&self, drive: &str, path: &str) -> Vec<String> {
        let Some(id) = self.resolve(drive, path) else {
            return Vec::new();
        };
        self.state
            .lock()
            .unwrap()
            .children(drive, &id)
            .into_iter()
            .map(|node| node.name.clone())
            .collect()
    }

    /// The chunk starting at `start` is stored but answered with an error.
    pub fn lose_chunk_response(&self, start: u64) {
        self.state
            .lock()
            .unwrap()
            .lost_chunk_responses
            .insert(start);
    }

    pub fn chunk_starts(&self) -> Vec<u64> {
        self.state.lock().unwrap().chunk_starts.clone()
    }
}
