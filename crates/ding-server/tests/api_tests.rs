//! API integration tests for ding-server.
//!
//! These tests verify the core API endpoints work correctly with an in-memory database.

use axum_test::TestServer;
use ding_server::test_utils::create_test_app_with_state;
use serde_json::{json, Value};

/// Helper to create a test server.
async fn create_server() -> TestServer {
    let app = create_test_app_with_state().await;
    TestServer::new(app).expect("Failed to create test server")
}

fn repo_payload(name: &str) -> Value {
    json!({
        "name": name,
        "vcs": "git",
        "origin": format!("https://example.com/{name}.git"),
        "checkout_path": name,
        "build_script": "#!/bin/sh\necho ok\n",
    })
}

// =============================================================================
// Status Tests
// =============================================================================

mod status {
    use super::*;

    #[tokio::test]
    async fn status_returns_name_and_version() {
        let server = create_server().await;

        let response = server.get("/api/status").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["name"], "ding");
        assert!(body["version"].is_string());
    }
}

// =============================================================================
// Repository Tests
// =============================================================================

mod repositories {
    use super::*;

    #[tokio::test]
    async fn list_repos_empty() {
        let server = create_server().await;

        let response = server.get("/api/repos").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn create_repo_success() {
        let server = create_server().await;

        let response = server.post("/api/repos").json(&repo_payload("widget")).await;

        response.assert_status(axum::http::StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["name"], "widget");
        assert_eq!(body["vcs"], "git");
        assert!(body["id"].is_i64());
    }

    #[tokio::test]
    async fn create_repo_rejects_invalid_checkout_path() {
        let server = create_server().await;

        let mut payload = repo_payload("bad");
        payload["checkout_path"] = json!("/bad");

        let response = server.post("/api/repos").json(&payload).await;

        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "userError");
    }

    #[tokio::test]
    async fn create_repo_rejects_unknown_vcs() {
        let server = create_server().await;

        let mut payload = repo_payload("bad-vcs");
        payload["vcs"] = json!("svn");

        let response = server.post("/api/repos").json(&payload).await;

        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_repo_not_found() {
        let server = create_server().await;

        let response = server.get("/api/repos/missing").await;

        response.assert_status(axum::http::StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["code"], "userNotFound");
    }

    #[tokio::test]
    async fn create_and_get_repo() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("myrepo")).await;

        let response = server.get("/api/repos/myrepo").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["name"], "myrepo");
        assert_eq!(body["checkout_path"], "myrepo");
    }

    #[tokio::test]
    async fn save_repo_updates_existing() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("app")).await;

        let mut updated = repo_payload("app");
        updated["build_script"] = json!("#!/bin/sh\necho updated\n");

        let response = server.put("/api/repos/app").json(&updated).await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["build_script"].as_str().unwrap().contains("updated"));
    }

    #[tokio::test]
    async fn save_repo_not_found() {
        let server = create_server().await;

        let response = server.put("/api/repos/ghost").json(&repo_payload("ghost")).await;

        response.assert_status(axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn remove_repo() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("disposable")).await;

        let delete_response = server.delete("/api/repos/disposable").await;
        delete_response.assert_status(axum::http::StatusCode::NO_CONTENT);

        let get_response = server.get("/api/repos/disposable").await;
        get_response.assert_status(axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_repos_after_create() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("one")).await;
        server.post("/api/repos").json(&repo_payload("two")).await;

        let response = server.get("/api/repos").await;
        let body: Value = response.json();

        assert_eq!(body.as_array().unwrap().len(), 2);
    }
}

// =============================================================================
// Build Tests
// =============================================================================

mod builds {
    use super::*;

    #[tokio::test]
    async fn list_builds_for_unknown_repo() {
        let server = create_server().await;

        let response = server.get("/api/repos/ghost/builds").await;

        response.assert_status(axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_builds_empty_for_known_repo() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("buildable")).await;

        let response = server.get("/api/repos/buildable/builds").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn create_build_unknown_repo() {
        let server = create_server().await;

        let payload = json!({ "repo": "ghost", "branch": "main" });

        let response = server.post("/api/builds").json(&payload).await;

        response.assert_status(axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_build_success() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("pipeline")).await;

        let payload = json!({ "repo": "pipeline", "branch": "main", "commit": "deadbeef" });
        let response = server.post("/api/builds").json(&payload).await;

        response.assert_status(axum::http::StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["branch"], "main");
        assert_eq!(body["status"], "new");
    }

    #[tokio::test]
    async fn create_build_defaults_empty_commit() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("nocommit")).await;

        let payload = json!({ "repo": "nocommit", "branch": "main" });
        let response = server.post("/api/builds").json(&payload).await;

        response.assert_status(axum::http::StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["commit_hash"], "");
    }

    #[tokio::test]
    async fn repo_builds_pairs_repos_with_latest_build() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("overview")).await;
        server
            .post("/api/builds")
            .json(&json!({ "repo": "overview", "branch": "main" }))
            .await;

        let response = server.get("/api/builds").await;

        response.assert_status_ok();
        let body: Value = response.json();
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["repo"]["name"], "overview");
        assert!(entries[0]["latestBuild"].is_object());
    }

    #[tokio::test]
    async fn remove_build() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("removable")).await;
        let create_response = server
            .post("/api/builds")
            .json(&json!({ "repo": "removable", "branch": "main" }))
            .await;
        let created: Value = create_response.json();
        let build_id = created["id"].as_i64().unwrap();

        let response = server.delete(&format!("/api/builds/{build_id}")).await;

        response.assert_status(axum::http::StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn remove_build_not_found() {
        let server = create_server().await;

        let response = server.delete("/api/builds/99999").await;

        response.assert_status(axum::http::StatusCode::NOT_FOUND);
    }
}

// =============================================================================
// Webhook Tests
// =============================================================================

mod webhooks {
    use super::*;
    use ding_core::crypto::hmac_sha1_hex;

    #[tokio::test]
    async fn github_webhook_unknown_repo() {
        let server = create_server().await;

        let response = server
            .post("/github/ghost")
            .add_header("X-Hub-Signature", "sha1=deadbeef")
            .bytes(br#"{"ref":"refs/heads/main","after":"abc"}"#.to_vec().into())
            .await;

        response.assert_status(axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn github_webhook_rejects_bad_signature() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("hooked")).await;

        let response = server
            .post("/github/hooked")
            .add_header("X-Hub-Signature", "sha1=deadbeef")
            .bytes(br#"{"ref":"refs/heads/main","after":"abc"}"#.to_vec().into())
            .await;

        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn github_webhook_accepts_valid_push() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("hooked2")).await;

        let body = br#"{"ref":"refs/heads/main","after":"abc123"}"#;
        let signature = format!("sha1={}", hmac_sha1_hex(b"test-github-secret", body));

        let response = server
            .post("/github/hooked2")
            .add_header("X-Hub-Signature", signature)
            .bytes(body.to_vec().into())
            .await;

        response.assert_status(axum::http::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn bitbucket_webhook_rejects_wrong_secret() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("bbhook")).await;

        let body = br#"{"push":{"changes":[]},"repository":{"scm":"git"}}"#;

        let response = server
            .post("/bitbucket/bbhook/wrong-secret")
            .bytes(body.to_vec().into())
            .await;

        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bitbucket_webhook_accepts_matching_secret() {
        let server = create_server().await;

        server.post("/api/repos").json(&repo_payload("bbhook2")).await;

        let body = br#"{"push":{"changes":[{"new":{"name":"main","type":"branch","heads":[{"hash":"abc123","type":"commit"}]}}]},"repository":{"scm":"git"}}"#;

        let response = server
            .post("/bitbucket/bbhook2/test-bitbucket-secret")
            .bytes(body.to_vec().into())
            .await;

        response.assert_status(axum::http::StatusCode::ACCEPTED);
    }
}

// =============================================================================
// Server-Sent Events
// =============================================================================

mod events {
    use super::*;

    #[tokio::test]
    async fn events_endpoint_is_reachable() {
        let server = create_server().await;

        let response = server.get("/events").await;

        response.assert_status_ok();
    }
}
