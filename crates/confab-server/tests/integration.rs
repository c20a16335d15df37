//! End-to-end tests over a real WebSocket connection.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use confab_core::ids::MessageId;
use confab_engine::{AgentDirectory, AgentPool, ContextSources, ConversationManager, PoolConfig, StaticContextLoader};
use confab_llm::{MockGenerator, MockReply};
use confab_server::{EngineOrchestrator, SeenMessages, ServerConfig, ServerHandle, Services};
use confab_store::{Database, SqliteStore};

const TIMEOUT: Duration = Duration::from_secs(5);
const ORG: &str = "org_acme";

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Boot a server on a random port and return its handle.
async fn boot_server(generator: MockGenerator) -> ServerHandle {
    let db = Database::in_memory().unwrap();
    let store = Arc::new(SqliteStore::new(db.clone()));
    let (tx, rx) = broadcast::channel(256);
    let directory = Arc::new(AgentDirectory::new(store.clone()));
    let conversations = Arc::new(ConversationManager::new(store, tx));
    let pool = Arc::new(AgentPool::new(
        directory.clone(),
        conversations.clone(),
        ContextSources::uniform(Arc::new(StaticContextLoader::new())),
        Arc::new(generator),
        PoolConfig::default(),
    ));
    let services = Services {
        orchestrator: Arc::new(EngineOrchestrator::new(conversations, directory.clone(), pool)),
        directory,
        db,
        generator: "mock".into(),
        events: rx,
    };
    let config = ServerConfig {
        port: 0,
        ..Default::default()
    };
    confab_server::start(config, services).await.unwrap()
}

struct TestClient {
    ws: WsStream,
    next_id: u64,
    /// Event frames read while waiting for responses.
    events: Vec<Value>,
}

impl TestClient {
    async fn connect(handle: &ServerHandle) -> Self {
        let url = format!("ws://127.0.0.1:{}/ws", handle.port);
        let (ws, _) = connect_async(url.as_str()).await.unwrap();
        Self {
            ws,
            next_id: 0,
            events: Vec::new(),
        }
    }

    async fn next_frame(&mut self) -> Value {
        loop {
            let msg = timeout(TIMEOUT, self.ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        let frame = json!({"method": method, "params": params, "id": id}).to_string();
        self.ws.send(Message::Text(frame)).await.unwrap();
        loop {
            let frame = self.next_frame().await;
            if frame.get("success").is_some() && frame["id"] == id {
                return frame;
            }
            self.events.push(frame);
        }
    }

    async fn ok(&mut self, method: &str, params: Value) -> Value {
        let resp = self.call(method, params).await;
        assert_eq!(resp["success"], true, "{method} failed: {resp}");
        resp["result"].clone()
    }

    /// Wait until `n` message_appended frames have arrived.
    async fn appended(&mut self, n: usize) -> Vec<Value> {
        loop {
            let found: Vec<Value> = self
                .events
                .iter()
                .filter(|e| e["type"] == "message_appended")
                .cloned()
                .collect();
            if found.len() >= n {
                return found;
            }
            let frame = self.next_frame().await;
            self.events.push(frame);
        }
    }
}

async fn specialist_id(client: &mut TestClient, name: &str) -> String {
    let seeded = client.ok("agent.seed", json!({"organizationId": ORG})).await;
    seeded["agents"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["name"] == name)
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn create_conversation(client: &mut TestClient, mode: &str, agents: &[&str]) -> String {
    let conv = client
        .ok(
            "conversation.create",
            json!({"organizationId": ORG, "ownerId": "user_ann", "title": "Planning", "mode": mode}),
        )
        .await;
    let id = conv["id"].as_str().unwrap().to_string();
    for agent in agents {
        client
            .ok("participant.add", json!({"conversationId": id, "agentId": agent}))
            .await;
    }
    id
}

#[tokio::test]
async fn free_mode_fans_out_to_subscribers() {
    let handle = boot_server(
        MockGenerator::new()
            .script("CFO", vec![MockReply::text("Margins are up.")])
            .script("CHRO", vec![MockReply::text("Hiring is on track.")]),
    )
    .await;
    let mut author = TestClient::connect(&handle).await;
    let mut watcher = TestClient::connect(&handle).await;

    let cfo = specialist_id(&mut author, "CFO").await;
    let chro = specialist_id(&mut author, "CHRO").await;
    let conv = create_conversation(&mut author, "free", &[&cfo, &chro]).await;

    author.ok("hub.subscribe", json!({"conversationId": conv})).await;
    watcher.ok("hub.subscribe", json!({"conversationId": conv})).await;

    let sent = author
        .ok(
            "conversation.send",
            json!({"conversationId": conv, "userId": "user_ann", "content": "Status?"}),
        )
        .await;
    let mut replies: Vec<&str> = sent["replies"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["content"].as_str().unwrap())
        .collect();
    replies.sort_unstable();
    assert_eq!(replies, vec!["Hiring is on track.", "Margins are up."]);

    // user message plus two replies reach both clients, in seq order
    let frames = watcher.appended(3).await;
    let seqs: Vec<u64> = frames.iter().map(|f| f["seq"].as_u64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(frames[0]["data"]["message"]["content"], "Status?");
    assert_eq!(author.appended(3).await.len(), 3);

    let status = watcher.ok("hub.subscribe", json!({"conversationId": conv})).await;
    assert_eq!(status["unread"], 3);
    let last = frames[2]["data"]["message"]["id"].as_str().unwrap().to_string();
    let marked = watcher
        .ok("hub.markRead", json!({"conversationId": conv, "messageId": last}))
        .await;
    assert_eq!(marked["unread"], 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn custom_agent_consults_specialist() {
    let handle = boot_server(
        MockGenerator::echo().script("Coach", vec![MockReply::delegate("finance", "Q3 budget?")]),
    )
    .await;
    let mut client = TestClient::connect(&handle).await;
    let _ = specialist_id(&mut client, "CFO").await;

    let coach = client
        .ok(
            "agent.createCustom",
            json!({
                "organizationId": ORG,
                "name": "Coach",
                "prompt": "Coach the team.",
                "contextScopes": ["people"],
                "canCallBuiltInAgents": true,
            }),
        )
        .await;
    let coach_id = coach["id"].as_str().unwrap().to_string();
    let conv = create_conversation(&mut client, "on_demand", &[&coach_id]).await;

    let sent = client
        .ok(
            "conversation.send",
            json!({"conversationId": conv, "userId": "user_ann", "content": "@Coach can we afford it?"}),
        )
        .await;
    let reply = &sent["replies"][0];
    assert_eq!(reply["status"], "sent");
    assert!(reply["content"]
        .as_str()
        .unwrap()
        .contains("finance says: CFO heard: Q3 budget?"));
    let trace = &reply["usage"]["delegations"][0];
    assert_eq!(trace["specialist_key"], "finance");
    assert_eq!(trace["succeeded"], true);

    handle.shutdown().await;
}

#[tokio::test]
async fn sender_receives_own_message_once_after_dedup() {
    let handle = boot_server(MockGenerator::echo()).await;
    let mut client = TestClient::connect(&handle).await;
    let conv = create_conversation(&mut client, "on_demand", &[]).await;
    client.ok("hub.subscribe", json!({"conversationId": conv})).await;

    let sent = client
        .ok(
            "conversation.send",
            json!({"conversationId": conv, "userId": "user_ann", "content": "note to self"}),
        )
        .await;
    let own_id = MessageId::from_raw(sent["message"]["id"].as_str().unwrap());

    let mut seen = SeenMessages::default();
    // the RPC response already carried the message
    assert!(seen.insert(&own_id));
    let echoed = client.appended(1).await;
    let echoed_id = MessageId::from_raw(echoed[0]["data"]["message"]["id"].as_str().unwrap());
    assert_eq!(echoed_id, own_id);
    assert!(!seen.insert(&echoed_id));

    handle.shutdown().await;
}

#[tokio::test]
async fn errors_and_health() {
    let handle = boot_server(MockGenerator::echo()).await;
    let mut client = TestClient::connect(&handle).await;

    let resp = client.call("conversation.get", json!({"conversationId": "conv_nope"})).await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "CONVERSATION_NOT_FOUND");

    let resp = client.call("nope.nope", json!({})).await;
    assert_eq!(resp["error"]["code"], "METHOD_NOT_FOUND");

    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");

    handle.shutdown().await;
}
