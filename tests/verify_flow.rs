use axum::{
    extract::{RawQuery, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use ura_verifier::{
    app::{self, AppStateBuilder},
    config::Config,
};

const TITLE: &str = "ID15993 - +55 21 97637-4845 - Chamada recebida";

#[derive(Clone, Default)]
struct Portal {
    with_call: bool,
    base: String,
    requests: Arc<Mutex<Vec<String>>>,
    updates: Arc<Mutex<Vec<Value>>>,
}

impl Portal {
    fn record(&self, method: &str, query: Option<String>) {
        let entry = match query {
            Some(query) => format!("{}?{}", method, query),
            None => method.to_string(),
        };
        self.requests.lock().unwrap().push(entry);
    }
}

fn pairs(query: &Option<String>) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_deref().unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

async fn deal_get(State(portal): State<Portal>, RawQuery(query): RawQuery) -> Json<Value> {
    portal.record("crm.deal.get", query);
    Json(json!({
        "result": {
            "ID": "15993",
            "TITLE": TITLE,
            "DATE_CREATE": "2025-03-10T14:05:00-03:00"
        }
    }))
}

async fn activity_list(State(portal): State<Portal>, RawQuery(query): RawQuery) -> Json<Value> {
    let owner_type = pairs(&query)
        .into_iter()
        .find(|(k, _)| k == "filter[OWNER_TYPE_ID]")
        .map(|(_, v)| v);
    portal.record("crm.activity.list", query);
    if portal.with_call && owner_type.as_deref() == Some("14") {
        Json(json!({
            "result": [{
                "ID": "5120",
                "OWNER_TYPE_ID": "14",
                "OWNER_ID": "655",
                "PROVIDER_ID": "VOXIMPLANT_CALL",
                "SETTINGS": { "MISSED_CALL": false },
                "SUBJECT": "Chamada recebida de +55 21 97637-4845",
                "CREATED": "2025-03-10T14:04:31-03:00",
                "ORIGIN_ID": "VI_123456"
            }],
            "total": 1
        }))
    } else {
        Json(json!({ "result": [], "total": 0 }))
    }
}

async fn statistic_get(State(portal): State<Portal>, RawQuery(query): RawQuery) -> Json<Value> {
    portal.record("voximplant.statistic.get", query);
    Json(json!({
        "result": [{
            "CALL_ID": "123456",
            "CALL_DURATION": 31,
            "CALL_FAILED_CODE": "200",
            "CALL_LOG": format!("{}/logs/123456.txt", portal.base)
        }]
    }))
}

async fn call_log(State(portal): State<Portal>) -> String {
    portal.record("call log", None);
    "14:04:31 Call.Connected\n14:04:40 Call.ToneReceived {tone: 1}\n14:05:02 Call.Disconnected\n"
        .to_string()
}

async fn deal_update(State(portal): State<Portal>, Json(body): Json<Value>) -> Json<Value> {
    portal.record("crm.deal.update", None);
    portal.updates.lock().unwrap().push(body);
    Json(json!({ "result": true }))
}

async fn start_portal(with_call: bool) -> Portal {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let portal = Portal {
        with_call,
        base,
        ..Default::default()
    };
    let app = Router::new()
        .route("/rest/1/secret/crm.deal.get", get(deal_get))
        .route("/rest/1/secret/crm.activity.list", get(activity_list))
        .route("/rest/1/secret/voximplant.statistic.get", get(statistic_get))
        .route("/rest/1/secret/crm.deal.update", post(deal_update))
        .route("/logs/123456.txt", get(call_log))
        .with_state(portal.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    portal
}

async fn start_verifier(portal: &Portal, token: CancellationToken) -> String {
    let mut config = Config::default();
    config.bitrix.webhook_url = format!("{}/rest/1/secret", portal.base);
    let state = AppStateBuilder::new()
        .config(config)
        .with_token(token)
        .build()
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(app::serve(state, listener));
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_tone_in_call_log_marks_sim() {
    let portal = start_portal(true).await;
    let token = CancellationToken::new();
    let verifier = start_verifier(&portal, token.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/verificar-ura", verifier))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("document_id%5B%5D=crm&document_id%5B%5D=CCrmDocumentDeal&document_id%5B%5D=DEAL_15993")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["dealId"], "15993");
    assert_eq!(body["phone"], "+55 21 97637-4845");
    assert_eq!(body["passouURA"], "Sim");
    assert_eq!(body["activityId"], "5120");
    assert_eq!(body["callId"], "123456");
    assert_eq!(body["updateResult"], true);

    assert_eq!(
        portal.updates.lock().unwrap().clone(),
        vec![json!({ "id": "15993", "fields": { "UF_CRM_1772056801": "Sim" } })]
    );

    let requests = portal.requests.lock().unwrap().clone();
    let methods: Vec<&str> = requests
        .iter()
        .map(|r| r.split('?').next().unwrap_or_default())
        .collect();
    assert_eq!(
        methods,
        vec![
            "crm.deal.get",
            "crm.activity.list",
            "crm.activity.list",
            "voximplant.statistic.get",
            "call log",
            "crm.deal.update",
        ]
    );
    assert!(requests[0].ends_with("id=15993"));
    let fallback = pairs(&requests[2].split_once('?').map(|(_, q)| q.to_string()));
    assert!(fallback.contains(&("filter[OWNER_ID]".to_string(), "655".to_string())));
    assert!(fallback.contains(&("filter[PROVIDER_ID]".to_string(), "VOXIMPLANT_CALL".to_string())));
    // window opens two hours before the deal was created
    assert!(fallback.contains(&(
        "filter[>CREATED]".to_string(),
        "2025-03-10T12:05:00-03:00".to_string()
    )));
    assert!(requests[3].contains("FILTER%5BCALL_ID%5D=123456"));

    token.cancel();
}

#[tokio::test]
async fn test_no_call_in_window_marks_nao() {
    let portal = start_portal(false).await;
    let token = CancellationToken::new();
    let verifier = start_verifier(&portal, token.clone()).await;

    let resp = reqwest::get(format!("{}/verificar-ura?dealId=15993", verifier))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["passouURA"], "Não");
    assert_eq!(body["motivo"], "Nenhuma atividade encontrada");
    assert!(body.get("callId").is_none());
    assert_eq!(
        portal.updates.lock().unwrap().clone(),
        vec![json!({ "id": "15993", "fields": { "UF_CRM_1772056801": "Não" } })]
    );
    assert!(!portal
        .requests
        .lock()
        .unwrap()
        .iter()
        .any(|r| r.starts_with("voximplant.statistic.get")));

    token.cancel();
}
