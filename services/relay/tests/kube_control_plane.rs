use std::io::Write;

use kube_relay::{ControlPlane, ControlPlaneError, KubeApiConfig, KubeControlPlane};
use serde_json::json;
use tempfile::NamedTempFile;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TRAEFIK_PATH: &str = "/api/v1/namespaces/kube-system/services/traefik";

fn token_file(token: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", token).unwrap();
    file
}

fn client(server: &MockServer, token: Option<&NamedTempFile>) -> KubeControlPlane {
    KubeControlPlane::new(&KubeApiConfig {
        api_url: server.uri(),
        token_file: token.map(|f| f.path().to_path_buf()),
        ca_file: None,
    })
    .unwrap()
}

#[tokio::test]
async fn returns_load_balancer_address_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TRAEFIK_PATH))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": { "name": "traefik", "namespace": "kube-system" },
            "spec": { "type": "LoadBalancer", "externalIPs": ["192.0.2.10"] },
            "status": { "loadBalancer": { "ingress": [{ "ip": "10.0.0.5" }] } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = token_file("s3cret");
    let addresses = client(&server, Some(&token))
        .get_service_address("kube-system", "traefik")
        .await
        .unwrap();

    assert_eq!(addresses, vec!["10.0.0.5", "192.0.2.10"]);
}

#[tokio::test]
async fn token_is_reread_on_every_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TRAEFIK_PATH))
        .and(header("authorization", "Bearer rotated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": { "loadBalancer": { "ingress": [{ "hostname": "lb.example.test" }] } }
        })))
        .mount(&server)
        .await;

    let token = token_file("original");
    let cp = client(&server, Some(&token));
    assert!(cp.get_service_address("kube-system", "traefik").await.is_err());

    std::fs::write(token.path(), "rotated\n").unwrap();
    let addresses = cp.get_service_address("kube-system", "traefik").await.unwrap();
    assert_eq!(addresses, vec!["lb.example.test"]);
}

#[tokio::test]
async fn pending_load_balancer_has_no_addresses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TRAEFIK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "spec": { "type": "LoadBalancer" },
            "status": { "loadBalancer": {} }
        })))
        .mount(&server)
        .await;

    let addresses = client(&server, None)
        .get_service_address("kube-system", "traefik")
        .await
        .unwrap();
    assert!(addresses.is_empty());
}

#[tokio::test]
async fn missing_service_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/services/nope"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client(&server, None)
        .get_service_address("default", "nope")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ControlPlaneError::NotFound {
            namespace: "default".to_string(),
            name: "nope".to_string(),
        }
    );
}

#[tokio::test]
async fn forbidden_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TRAEFIK_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_string("services is forbidden"))
        .mount(&server)
        .await;

    let err = client(&server, None)
        .get_service_address("kube-system", "traefik")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlPlaneError::Unauthorized(ref msg) if msg.contains("forbidden")));
}

#[tokio::test]
async fn server_error_keeps_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TRAEFIK_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("etcd unavailable"))
        .mount(&server)
        .await;

    let err = client(&server, None)
        .get_service_address("kube-system", "traefik")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ControlPlaneError::Status {
            status: 503,
            body: "etcd unavailable".to_string(),
        }
    );
}

#[tokio::test]
async fn malformed_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TRAEFIK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = client(&server, None)
        .get_service_address("kube-system", "traefik")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlPlaneError::Decode(_)));
}

#[tokio::test]
async fn unreachable_api_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cp = KubeControlPlane::new(&KubeApiConfig {
        api_url: format!("http://{}", addr),
        token_file: None,
        ca_file: None,
    })
    .unwrap();

    let err = cp.get_service_address("kube-system", "traefik").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::Transport(_)));
}

#[tokio::test]
async fn missing_token_file_is_unauthorized() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let cp = KubeControlPlane::new(&KubeApiConfig {
        api_url: server.uri(),
        token_file: Some(dir.path().join("token")),
        ca_file: None,
    })
    .unwrap();

    let err = cp.get_service_address("kube-system", "traefik").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::Unauthorized(_)));
}
