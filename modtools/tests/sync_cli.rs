//! End-to-end runs of modtools against a local XRPC server
//!
//! Stages the likers of a post, then drains them, the same way a moderator
//! would from the shell.

use assert_cmd::Command;
use mockito::{Matcher, Mock, Server, ServerGuard};
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;

const POST_URL: &str = "https://bsky.app/profile/author.bsky.social/post/3kpost";
const POST_URI: &str = "at://did:plc:author/app.bsky.feed.post/3kpost";
const LIST_URL: &str = "https://bsky.app/profile/me.bsky.social/lists/3kmod";
const LIST_URI: &str = "at://did:plc:me/app.bsky.graph.list/3kmod";

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

fn setup_config(service: &str, extra_bluesky: &str) -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("actions.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[bluesky]
handle = "me.bsky.social"
service = "{}"
{}

[credentials]
storage = "env"
"#,
        escape_path_for_toml(&db_path.to_string_lossy()),
        service,
        extra_bluesky
    );
    fs::write(&config_path, config_content).unwrap();

    (temp_dir, config_path.to_string_lossy().to_string())
}

fn modtools(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("modtools").unwrap();
    cmd.env("MODTOOLS_CONFIG", config_path)
        .env("MODTOOLS_APP_PASSWORD", "app-pass-word")
        .env_remove("MODTOOLS_DB_PATH");
    cmd
}

fn mock_resolve(server: &mut ServerGuard, handle: &str, did: &str) -> Mock {
    server
        .mock("GET", "/xrpc/com.atproto.identity.resolveHandle")
        .match_query(Matcher::UrlEncoded("handle".into(), handle.into()))
        .with_status(200)
        .with_body(json!({ "did": did }).to_string())
        .create()
}

/// Login, handle resolution, two likers, an empty list; returns the
/// createRecord mock, which expects one call per liker
fn mock_bluesky(server: &mut ServerGuard) -> Mock {
    server
        .mock("POST", "/xrpc/com.atproto.server.createSession")
        .match_body(Matcher::PartialJson(json!({
            "identifier": "me.bsky.social",
            "password": "app-pass-word",
        })))
        .with_status(200)
        .with_body(
            json!({
                "accessJwt": "access",
                "refreshJwt": "refresh",
                "handle": "me.bsky.social",
                "did": "did:plc:me",
            })
            .to_string(),
        )
        .create();

    mock_resolve(server, "author.bsky.social", "did:plc:author");
    mock_resolve(server, "me.bsky.social", "did:plc:me");

    server
        .mock("GET", "/xrpc/app.bsky.feed.getLikes")
        .match_query(Matcher::UrlEncoded("uri".into(), POST_URI.into()))
        .with_status(200)
        .with_body(
            json!({
                "uri": POST_URI,
                "likes": [
                    {"actor": {"did": "did:plc:troll1", "handle": "troll1.bsky.social"}, "createdAt": "2024-01-01T00:00:00Z"},
                    {"actor": {"did": "did:plc:troll2", "handle": "troll2.bsky.social"}, "createdAt": "2024-01-01T00:00:01Z"}
                ]
            })
            .to_string(),
        )
        .create();

    server
        .mock("GET", "/xrpc/app.bsky.graph.getList")
        .match_query(Matcher::UrlEncoded("list".into(), LIST_URI.into()))
        .with_status(200)
        .with_body(json!({ "list": {"uri": LIST_URI, "name": "trolls"}, "items": [] }).to_string())
        .create();

    server
        .mock("POST", "/xrpc/com.atproto.repo.createRecord")
        .match_header("authorization", "Bearer access")
        .match_body(Matcher::PartialJson(json!({
            "repo": "did:plc:me",
            "collection": "app.bsky.graph.listitem",
            "record": { "list": LIST_URI },
        })))
        .with_status(200)
        .with_body(r#"{"uri":"at://did:plc:me/app.bsky.graph.listitem/3kitem","cid":"bafy"}"#)
        .expect(2)
        .create()
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "exit {:?}, stderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_stage_then_drain_json() {
    let mut server = Server::new();
    let create_record = mock_bluesky(&mut server);
    let (_temp, config) = setup_config(&server.url(), "");

    let staged = json_stdout(modtools(&config).args([
        "add_likes_to_be_processed",
        POST_URL,
        "--list",
        LIST_URL,
        "--format",
        "json",
    ]));
    assert_eq!(staged["post"], POST_URI);
    assert_eq!(staged["list"], LIST_URI);
    assert_eq!(staged["likers"], 2);
    assert_eq!(staged["enqueued"], 2);

    let synced = json_stdout(modtools(&config).args(["process_list", LIST_URL, "--format", "json"]));
    // Both subcommands canonicalise the handle URL to the same at-uri
    assert_eq!(synced["list"], staged["list"]);
    assert_eq!(synced["done"], 2);
    assert_eq!(synced["processed"], 2);
    assert_eq!(synced["failed"], 0);
    assert_eq!(synced["interrupted"], false);
    assert_eq!(synced["deferred_until"], Value::Null);

    create_record.assert();

    // A second drain has nothing left to add
    let again = json_stdout(modtools(&config).args(["process_list", LIST_URI, "--format", "json"]));
    assert_eq!(again["processed"], 0);
    create_record.assert();
}

#[test]
fn test_default_list_and_text_reports() {
    let mut server = Server::new();
    let create_record = mock_bluesky(&mut server);
    let (_temp, config) = setup_config(&server.url(), &format!("default_list = \"{}\"", LIST_URL));

    modtools(&config)
        .args(["add_likes_to_be_processed", POST_URL])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("List:  {}", LIST_URI)))
        .stdout(predicate::str::contains("Likers found:      2"))
        .stdout(predicate::str::contains("Newly staged:      2"));

    // Staging again merges into the existing actions
    modtools(&config)
        .args(["add_likes_to_be_processed", POST_URL])
        .assert()
        .success()
        .stdout(predicate::str::contains("Newly staged:      0"))
        .stdout(predicate::str::contains("Already pending:   2"));

    modtools(&config)
        .args(["process_list", LIST_URL])
        .assert()
        .code(0)
        .stdout(predicate::str::contains(format!("List: {}", LIST_URI)))
        .stdout(predicate::str::contains("Added:            2"))
        .stdout(predicate::str::contains("Failed:           0"));

    create_record.assert();
}
