//! HTTP control-plane client against a mock panel

use fleet_node_controller::api::{
    ControlPlane, HttpControlPlane, NodeType, Transport, UserTraffic,
};
use fleet_node_controller::config::Config;
use fleet_node_controller::Error;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> HttpControlPlane {
    let raw = format!(
        r#"
        [api]
        host = "{}/"
        node_id = 7
        key = "secret"
        timeout_secs = 5
        "#,
        server.uri()
    );
    let config = Config::from_toml_str(&raw).unwrap();
    HttpControlPlane::new(&config.api).unwrap()
}

#[tokio::test]
async fn test_node_info_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/node/info"))
        .and(query_param("node_id", "7"))
        .and(query_param("key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "node_type": "V2ray",
            "node_id": 7,
            "port": 443,
            "transport": "ws",
            "path": "/ray",
            "enable_tls": true,
            "cert_mode": "http",
            "cert_domain": "node7.example.com"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let node = client.get_node_info().await.unwrap();
    assert_eq!(node.node_type, NodeType::Vmess);
    assert_eq!(node.port, 443);
    assert_eq!(node.transport, Transport::Ws);
    assert_eq!(node.path, "/ray");
    assert!(node.enable_tls);

    let identity = client.describe();
    assert_eq!(identity.api_host, server.uri());
    assert_eq!(identity.node_id, 7);
}

#[tokio::test]
async fn test_user_list_honours_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/node/users"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/node/users"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(json!([
                    {"uid": 1, "email": "a@example.com", "uuid": "u-1"},
                    {"uid": 2, "email": "b@example.com", "passwd": "p", "speed_limit": 1024}
                ])),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let users = client.get_user_list().await.unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[1].speed_limit, 1024);

    let err = client.get_user_list().await.unwrap_err();
    assert!(matches!(err, Error::UsersUnchanged));
}

#[tokio::test]
async fn test_error_status_becomes_control_plane_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/node/rules"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database down"))
        .mount(&server)
        .await;

    let err = client_for(&server).get_node_rule().await.unwrap_err();
    match err {
        Error::ControlPlaneError { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database down");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_body_is_a_serialization_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/node/relay"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = client_for(&server).get_relay_node_info().await.unwrap_err();
    assert!(matches!(err, Error::SerializationError(_)));
}

#[tokio::test]
async fn test_traffic_is_posted_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/node/traffic"))
        .and(query_param("node_id", "7"))
        .and(body_json(json!([
            {"uid": 1, "email": "a@example.com", "upload": 100, "download": 200}
        ])))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let traffic = vec![UserTraffic {
        uid: 1,
        email: "a@example.com".to_string(),
        upload: 100,
        download: 200,
    }];
    client_for(&server)
        .report_user_traffic(&traffic)
        .await
        .unwrap();
}
