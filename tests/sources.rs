use package_harvester::harvest::sources::{AurAdapter, FlathubAdapter, NixpkgsAdapter};
use package_harvester::harvest::traits::{SourceAdapter, SourceError};
use package_harvester::{HarvestConfig, SourceType};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.backoff.base_delay_ms = 1;
    config.backoff.max_delay_ms = 5;
    config
}

const CALCULATOR_MANIFEST: &str = r#"
app-id: org.gnome.Calculator
runtime: org.gnome.Platform
runtime-version: '46'
sdk: org.gnome.Sdk
command: gnome-calculator
finish-args:
  - --share=ipc
modules:
  - name: mpfr
  - name: gnome-calculator
"#;

#[tokio::test]
async fn test_flathub_enumerates_and_fetches_manifest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orgs/flathub/repos"))
        .and(query_param("page", "1"))
        .and(header("authorization", "Bearer ghp_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "name": "org.gnome.Calculator", "archived": false },
            { "name": "org.example.Retired", "archived": true },
            { "name": "shared-modules", "archived": false }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flathub/org.gnome.Calculator/master/org.gnome.Calculator.yml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CALCULATOR_MANIFEST))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.credentials.insert(SourceType::Flathub, "ghp_test".to_string());
    config.flathub.api_base = server.uri();
    config.flathub.raw_base = server.uri();
    let adapter = FlathubAdapter::new(&config, CancellationToken::new()).unwrap();

    let page = adapter.enumerate(None).await.unwrap();
    assert_eq!(page.ids, vec!["org.gnome.Calculator"]);
    assert_eq!(page.next_cursor, None);

    let record = adapter.fetch_one("org.gnome.Calculator").await.unwrap();
    assert_eq!(record.id(), "flathub:org.gnome.Calculator");
    assert_eq!(record.dependencies(), ["mpfr"]);
    assert_eq!(record.frameworks(), ["org.gnome.Platform//46", "org.gnome.Sdk//46"]);
    assert_eq!(record.metadata()["manifest_file"], "org.gnome.Calculator.yml");
    assert_eq!(record.metadata()["package_name"], "calculator");
    assert_eq!(record.metadata()["command"], "gnome-calculator");
}

#[tokio::test]
async fn test_flathub_without_manifest_is_not_found() {
    let server = MockServer::start().await;
    let mut config = fast_config();
    config.credentials.insert(SourceType::Flathub, "ghp_test".to_string());
    config.flathub.raw_base = server.uri();
    let adapter = FlathubAdapter::new(&config, CancellationToken::new()).unwrap();

    let err = adapter.fetch_one("org.example.Empty").await.unwrap_err();
    assert!(matches!(err, SourceError::NotFound(_)));
}

#[tokio::test]
async fn test_nixpkgs_fetches_by_name_expression() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nixpkgs/pkgs/by-name/he/hello/package.nix"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{ lib, stdenv, fetchurl, gettext }:
stdenv.mkDerivation rec {
  pname = "hello";
  version = "2.12.1";
  src = fetchurl {
    url = "mirror://gnu/hello/hello-${version}.tar.gz";
  };
  buildInputs = [ gettext ];
  meta = with lib; {
    description = "A program that produces a familiar, friendly greeting";
  };
}"#,
        ))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.nixpkgs.raw_base = format!("{}/nixpkgs", server.uri());
    config.nixpkgs.candidates = vec!["hello".to_string()];
    let adapter = NixpkgsAdapter::new(&config, CancellationToken::new()).unwrap();

    let record = adapter.fetch_one("hello").await.unwrap();
    assert_eq!(record.id(), "nix:hello");
    assert_eq!(record.version(), Some("2.12.1"));
    assert_eq!(record.build_dependencies(), ["gettext"]);
    assert_eq!(
        record.description(),
        Some("A program that produces a familiar, friendly greeting")
    );
    assert_eq!(
        record.metadata()["expression_path"],
        "pkgs/by-name/he/hello/package.nix"
    );

    let err = adapter.fetch_one("absent").await.unwrap_err();
    assert!(matches!(err, SourceError::NotFound(_)));
}

#[tokio::test]
async fn test_aur_merges_rpc_and_pkgbuild() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rpc/"))
        .and(query_param("type", "info"))
        .and(query_param("arg[]", "yay"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "version": 5,
            "type": "multiinfo",
            "resultcount": 1,
            "results": [{
                "Name": "yay",
                "PackageBase": "yay",
                "Version": "12.3.5-1",
                "Description": "Yet another yogurt. Pacman wrapper and AUR helper written in go.",
                "URL": "https://github.com/Jguer/yay",
                "NumVotes": 2000,
                "Maintainer": "jguer"
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cgit/aur.git/plain/PKGBUILD"))
        .and(query_param("h", "yay"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "pkgname=yay\npkgver=12.3.5\npkgrel=1\npkgdesc=\"Yet another yogurt\"\n\
             depends=('pacman>6.1' 'git')\nmakedepends=('go>=1.21')\n",
        ))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.aur.base_url = server.uri();
    let adapter = AurAdapter::new(&config, CancellationToken::new()).unwrap();

    let record = adapter.fetch_one("yay").await.unwrap();
    assert_eq!(record.id(), "arch:yay");
    assert_eq!(record.version(), Some("12.3.5-1"));
    assert_eq!(record.description(), Some("Yet another yogurt"));
    assert_eq!(record.dependencies(), ["pacman", "git"]);
    assert_eq!(record.build_dependencies(), ["go"]);
    assert_eq!(record.metadata()["package_base"], "yay");
    assert_eq!(record.metadata()["aur"]["maintainer"], "jguer");
}

#[tokio::test]
async fn test_aur_unknown_package_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rpc/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "version": 5, "type": "multiinfo", "resultcount": 0, "results": []
        })))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.aur.base_url = server.uri();
    let adapter = AurAdapter::new(&config, CancellationToken::new()).unwrap();
    let err = adapter.fetch_one("nope").await.unwrap_err();
    assert!(matches!(err, SourceError::NotFound(_)));
}

#[tokio::test]
async fn test_aur_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rpc/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.aur.base_url = server.uri();
    let adapter = AurAdapter::new(&config, CancellationToken::new()).unwrap();
    let err = adapter.fetch_one("yay").await.unwrap_err();
    assert!(matches!(err, SourceError::RetriesExhausted { attempts: 3, .. }));
}

async fn mount_flathub_listing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/orgs/flathub/repos"))
        .and(query_param("page", "1"))
        .and(header("authorization", "Bearer ghp_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "name": "org.gnome.Calculator", "archived": false },
            { "name": "org.mozilla.firefox", "archived": false },
            { "name": "io.gitlab.Firefox", "archived": false },
            { "name": "org.example.Retired", "archived": true },
            { "name": "shared-modules", "archived": false }
        ])))
        .mount(server)
        .await;
}

fn flathub_listing_config(server: &MockServer) -> HarvestConfig {
    let mut config = fast_config();
    config.credentials.insert(SourceType::Flathub, "ghp_test".to_string());
    config.flathub.api_base = format!("{}/api", server.uri());
    config
}

#[tokio::test]
async fn test_nixpkgs_candidates_extend_with_flathub_names() {
    let server = MockServer::start().await;
    mount_flathub_listing(&server).await;

    let mut config = flathub_listing_config(&server);
    config.nixpkgs.candidates = vec!["zlib".to_string()];
    config.nixpkgs.candidates_from_flathub = true;
    let adapter = NixpkgsAdapter::new(&config, CancellationToken::new()).unwrap();

    let first = adapter.enumerate(None).await.unwrap();
    assert_eq!(first.ids, vec!["zlib"]);
    assert_eq!(first.next_cursor.as_deref(), Some("flathub:1"));

    let second = adapter.enumerate(first.next_cursor.as_deref()).await.unwrap();
    assert_eq!(second.ids, vec!["calculator", "firefox"]);
    assert_eq!(second.next_cursor, None);
}

#[tokio::test]
async fn test_aur_candidates_from_flathub_alone() {
    let server = MockServer::start().await;
    mount_flathub_listing(&server).await;

    let mut config = flathub_listing_config(&server);
    config.aur.candidates_from_flathub = true;
    let adapter = AurAdapter::new(&config, CancellationToken::new()).unwrap();

    let page = adapter.enumerate(None).await.unwrap();
    assert_eq!(page.ids, vec!["calculator", "firefox"]);
    assert_eq!(page.next_cursor, None);

    config.credentials.clear();
    assert!(matches!(
        AurAdapter::new(&config, CancellationToken::new()),
        Err(SourceError::Config(_))
    ));
}

#[tokio::test]
async fn test_aur_package_names_are_query_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rpc/"))
        .and(query_param("arg[]", "libc++"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "version": 5,
            "type": "multiinfo",
            "resultcount": 1,
            "results": [{ "Name": "libc++", "PackageBase": "libc++", "Version": "18.1.8-1" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cgit/aur.git/plain/PKGBUILD"))
        .and(query_param("h", "libc++"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "pkgname=libc++\npkgver=18.1.8\npkgrel=1\ndepends=('gcc-libs')\n",
        ))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.aur.base_url = server.uri();
    let adapter = AurAdapter::new(&config, CancellationToken::new()).unwrap();

    let record = adapter.fetch_one("libc++").await.unwrap();
    assert_eq!(record.id(), "arch:libc++");
    assert_eq!(record.dependencies(), ["gcc-libs"]);
}

#[tokio::test]
async fn test_flathub_token_not_sent_to_raw_host() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/flathub/org.gnome.Calculator/master/org.gnome.Calculator.yml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CALCULATOR_MANIFEST))
        .mount(&server)
        .await;

    let mut config = flathub_listing_config(&server);
    config.flathub.raw_base = format!("{}/raw", server.uri());
    let adapter = FlathubAdapter::new(&config, CancellationToken::new()).unwrap();
    adapter.fetch_one("org.gnome.Calculator").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(!requests.is_empty());
    assert!(requests.iter().all(|r| r.headers.get("authorization").is_none()));
}
