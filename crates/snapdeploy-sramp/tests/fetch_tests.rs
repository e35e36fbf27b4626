use snapdeploy::{ArtifactError, ArtifactRef, ArtifactRepository};
use snapdeploy_sramp::{SrampClient, SrampConfig};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, username: Option<&str>) -> SrampClient {
    SrampClient::new(SrampConfig {
        base_url: format!("{}/s-ramp-server", server.uri()),
        username: username.map(str::to_owned),
        password: username.map(|_| "secret".to_owned()),
    })
}

fn jar() -> ArtifactRef {
    ArtifactRef::new("e6a1-jar", "app-1.2.jar", "ext/JavaArchive")
}

#[tokio::test]
async fn streams_content_into_sink() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();

    Mock::given(method("GET"))
        .and(path("/s-ramp-server/s-ramp/ext/JavaArchive/e6a1-jar/media"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.clone(), "application/java-archive"))
        .mount(&server)
        .await;

    let mut sink = Vec::new();
    let written = client_for(&server, None)
        .fetch_content(&jar(), &mut sink)
        .await
        .unwrap();

    assert_eq!(written, body.len() as u64);
    assert_eq!(sink, body);
}

#[tokio::test]
async fn sends_basic_auth_when_configured() {
    let server = MockServer::start().await;

    // admin:secret
    Mock::given(method("GET"))
        .and(path("/s-ramp-server/s-ramp/ext/JavaArchive/e6a1-jar/media"))
        .and(header("Authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"jar".to_vec(), "application/octet-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let mut sink = Vec::new();
    client_for(&server, Some("admin"))
        .fetch_content(&jar(), &mut sink)
        .await
        .unwrap();

    assert_eq!(sink, b"jar");
}

#[tokio::test]
async fn missing_artifact_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut sink = Vec::new();
    let err = client_for(&server, None)
        .fetch_content(&jar(), &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::NotFound(_)));
    assert!(sink.is_empty());
}

#[tokio::test]
async fn server_error_is_transport_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut sink = Vec::new();
    let err = client_for(&server, None)
        .fetch_content(&jar(), &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::Transport(ref msg) if msg.contains("503")));
}

#[test]
fn artifact_name_is_the_file_name() {
    let client = SrampClient::new(SrampConfig::default());
    assert_eq!(client.artifact_name(&jar()), "app-1.2.jar");
}
