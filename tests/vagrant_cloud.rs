//! HTTP-level tests for the Vagrant Cloud registry client.

use alcib::pipeline::{PipelineState, Stage, StagePipeline};
use alcib::target::{Architecture, BackendKind, ImageKind};
use alcib::test_support::{
    ScriptedRunner, build_config, scripted_services, scripted_target, success,
};
use alcib::vagrant_cloud::{BoxRegistry, RegistryError, VagrantCloudClient, VersionProbe};
use camino::Utf8PathBuf;
use mockito::{Matcher, Server};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

const BOX: &str = "almalinux/8";
const TOKEN: &str = "vc-token";
const SUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn client(server: &Server) -> VagrantCloudClient {
    VagrantCloudClient::new(
        &format!("{}/", server.url()),
        Some(String::from(BOX)),
        Some(String::from(TOKEN)),
    )
}

#[rstest]
#[case(404, VersionProbe::Missing)]
#[case(200, VersionProbe::Present(200))]
#[case(500, VersionProbe::Present(500))]
#[tokio::test]
async fn probe_classifies_the_status(#[case] status: usize, #[case] expected: VersionProbe) {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/box/almalinux/8/version/8.5.20211020")
        .match_header("authorization", "Bearer vc-token")
        .with_status(status)
        .create_async()
        .await;

    let probe = client(&server)
        .probe_version("8.5.20211020")
        .await
        .expect("probe answered");

    assert_eq!(probe, expected);
    mock.assert_async().await;
}

#[tokio::test]
async fn create_version_posts_the_description() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/box/almalinux/8/versions")
        .match_header("authorization", "Bearer vc-token")
        .match_body(Matcher::Json(json!({
            "version": { "version": "8.5.20211020", "description": "monthly rebuild" }
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    client(&server)
        .create_version("8.5.20211020", "monthly rebuild")
        .await
        .expect("version created");

    mock.assert_async().await;
}

#[tokio::test]
async fn create_provider_declares_the_sha256_checksum() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/box/almalinux/8/version/8.5.20211020/providers")
        .match_body(Matcher::Json(json!({
            "provider": { "name": "libvirt", "checksum_type": "sha256", "checksum": SUM }
        })))
        .with_status(201)
        .create_async()
        .await;

    client(&server)
        .create_provider("8.5.20211020", "libvirt", SUM)
        .await
        .expect("provider registered");

    mock.assert_async().await;
}

#[tokio::test]
async fn create_provider_reuses_an_existing_registration() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/box/almalinux/8/version/8.5.20211020/providers")
        .with_status(422)
        .with_body(r#"{"errors":["Metadata provider must be unique for version"]}"#)
        .create_async()
        .await;

    client(&server)
        .create_provider("8.5.20211020", "libvirt", SUM)
        .await
        .expect("existing provider accepted");

    mock.assert_async().await;
}

#[tokio::test]
async fn create_provider_surfaces_other_error_status() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/box/almalinux/8/version/8.5.20211020/providers")
        .with_status(401)
        .with_body("bad token")
        .create_async()
        .await;

    let err = client(&server)
        .create_provider("8.5.20211020", "libvirt", SUM)
        .await
        .expect_err("rejected");

    assert_eq!(
        err,
        RegistryError::Status {
            operation: "create provider",
            status: 401,
            body: String::from("bad token"),
        }
    );
}

#[tokio::test]
async fn box_rerelease_uploads_over_an_existing_provider() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/box/almalinux/8/version/8.5.20211020")
        .with_status(200)
        .create_async()
        .await;
    let versions = server
        .mock("POST", "/box/almalinux/8/versions")
        .expect(0)
        .create_async()
        .await;
    server
        .mock("POST", "/box/almalinux/8/version/8.5.20211020/providers")
        .with_status(422)
        .with_body(r#"{"errors":["Metadata provider must be unique for version"]}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/box/almalinux/8/version/8.5.20211020/provider/libvirt/upload")
        .with_status(200)
        .with_body(r#"{"upload_path":"https://uploads.example.test/box/token-1"}"#)
        .create_async()
        .await;

    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 temp dir");
    let config = build_config(&root, "Vagrant Box");
    let runner = ScriptedRunner::permissive();
    runner.respond_to(
        "output -json",
        success(r#"{"instance_public_ip":{"value":"3.3.3.3"},"instance_id":{"value":"i-1"}}"#),
    );
    runner.respond_to(
        "sha256sum *.box",
        success(format!("{SUM}  almalinux-8-libvirt.box\n")),
    );
    let target = scripted_target(BackendKind::Kvm, Architecture::X86_64, &config, &runner)
        .expect("supported target");
    let services = scripted_services(&runner, &config, client(&server)).expect("services");
    let mut pipeline = StagePipeline::new(
        &config,
        ImageKind::VagrantBox,
        target,
        services,
        "20211020",
    )
    .resume_at(Stage::Release);

    let state = pipeline.run(Stage::Release).await.expect("release succeeds");

    assert_eq!(state, PipelineState::Released);
    versions.assert_async().await;
    let uploads = runner.invocations_matching("curl --fail");
    assert_eq!(uploads.len(), 1);
    let line = uploads.first().expect("upload invocation").last_arg();
    assert!(line.contains("https://uploads.example.test/box/token-1"), "{line}");
}

#[tokio::test]
async fn upload_url_returns_the_upload_path() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/box/almalinux/8/version/8.5.20211020/provider/libvirt/upload")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"upload_path":"https://archivist.example.test/v1/object/abc"}"#)
        .create_async()
        .await;

    let url = client(&server)
        .upload_url("8.5.20211020", "libvirt")
        .await
        .expect("upload url");

    assert_eq!(url, "https://archivist.example.test/v1/object/abc");
}

#[tokio::test]
async fn upload_url_without_path_is_an_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/box/almalinux/8/version/8.5.20211020/provider/libvirt/upload")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let err = client(&server)
        .upload_url("8.5.20211020", "libvirt")
        .await
        .expect_err("no path");

    assert_eq!(err, RegistryError::MissingUploadPath);
}

#[tokio::test]
async fn missing_token_fails_before_any_request() {
    let registry = VagrantCloudClient::new(
        "http://127.0.0.1:9",
        Some(String::from(BOX)),
        None,
    );

    let err = registry
        .probe_version("8.5.20211020")
        .await
        .expect_err("no token");

    assert_eq!(
        err,
        RegistryError::NotConfigured {
            field: "vagrant_cloud_token",
            env_var: "ALCIB_VAGRANT_CLOUD_TOKEN",
        }
    );
}
