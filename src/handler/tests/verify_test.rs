use crate::app::{self, AppState, AppStateBuilder};
use crate::config::Config;
use crate::crm::fake::{activity, FakeCrm};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

const TITLE: &str = "ID15993 - +55 21 97637-4845 - Chamada recebida";
const CREATED: &str = "2025-03-10T14:05:00-03:00";

struct TestServer {
    addr: SocketAddr,
    state: AppState,
}

impl TestServer {
    async fn start(crm: Arc<FakeCrm>) -> Self {
        let state = AppStateBuilder::new()
            .config(Config::default())
            .crm(crm)
            .build()
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(app::serve(state.clone(), listener));
        Self { addr, state }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.token.cancel();
    }
}

fn answered_call() -> FakeCrm {
    FakeCrm::default()
        .with_deal("15993", TITLE, CREATED)
        .with_activity(activity(
            "5120",
            "Chamada recebida de +55 21 97637-4845",
            "2025-03-10T14:04:31-03:00",
            "VI_123456",
        ))
        .with_statistic("123456", Some("https://logs.example.com/123456"))
        .with_log(
            "https://logs.example.com/123456",
            "Call.Connected\nCall.ToneReceived\nCall.Disconnected",
        )
}

#[tokio::test]
async fn test_missing_identifier_is_rejected_without_upstream_calls() {
    let crm = Arc::new(answered_call());
    let server = TestServer::start(crm.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/verificar-ura"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("auth%5Bdomain%5D=example.bitrix24.com.br")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "error": "identifier not found" }));

    let resp = client.get(server.url("/verificar-ura")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(crm.calls().is_empty());
}

#[tokio::test]
async fn test_bitrix_robot_form_post() {
    let crm = Arc::new(answered_call());
    let server = TestServer::start(crm.clone()).await;

    let resp = reqwest::Client::new()
        .post(server.url("/.netlify/functions/verificar-ura"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("document_id%5B0%5D=crm&document_id%5B1%5D=CCrmDocumentDeal&document_id%5B2%5D=DEAL_15993")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["dealId"], "15993");
    assert_eq!(body["phone"], "+55 21 97637-4845");
    assert_eq!(body["passouURA"], "Sim");
    assert_eq!(body["callId"], "123456");
    assert_eq!(crm.field("15993").as_deref(), Some("Sim"));
}

#[tokio::test]
async fn test_json_body_and_query_string() {
    let crm = Arc::new(FakeCrm::default().with_deal("15993", TITLE, CREATED));
    let server = TestServer::start(crm.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/verificar-ura"))
        .json(&json!({ "dealId": 15993 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["passouURA"], "Não");
    assert_eq!(body["motivo"], "Nenhuma atividade encontrada");

    let resp = client
        .get(server.url("/verificar-ura?dealId=15993"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(crm.updates().len(), 2);
}

#[tokio::test]
async fn test_unknown_deal_and_upstream_failure() {
    let crm = Arc::new(FakeCrm::default());
    let server = TestServer::start(crm.clone()).await;
    let resp = reqwest::get(server.url("/verificar-ura?dealId=777")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "error": "deal not found", "dealId": "777" }));
    assert!(crm.updates().is_empty());

    let crm = Arc::new(answered_call().failing_on("crm.deal.update"));
    let server = TestServer::start(crm).await;
    let resp = reqwest::get(server.url("/verificar-ura?dealId=15993")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("crm.deal.update:"));
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(Arc::new(FakeCrm::default())).await;
    let resp = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"]
        .as_str()
        .unwrap()
        .starts_with(env!("CARGO_PKG_VERSION")));
}
