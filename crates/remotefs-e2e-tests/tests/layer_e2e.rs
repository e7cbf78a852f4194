// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![cfg(target_os = "linux")]

use remotefs_e2e_tests::{bare, bridge_library, run_ok, AgentFixture, LOREM, SHORT_TEXT};
use std::fs;

const HELPER: &str = env!("CARGO_BIN_EXE_remotefs-test-helper");

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_remote_file() {
    let agent = AgentFixture::start().await.unwrap();
    let stdout = run_ok(
        agent
            .layered(HELPER)
            .args(["read", "/app/test.txt", "--expect", LOREM]),
    )
    .await
    .unwrap();
    assert_eq!(stdout, LOREM);
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_land_on_agent_and_read_back() {
    let agent = AgentFixture::start().await.unwrap();
    for text in [SHORT_TEXT, LOREM, ""] {
        run_ok(
            agent
                .layered(HELPER)
                .args(["write", "/app/out.txt", "--text", text]),
        )
        .await
        .unwrap();
        assert_eq!(fs::read_to_string(agent.app_dir().join("out.txt")).unwrap(), text);

        run_ok(
            agent
                .layered(HELPER)
                .args(["read", "/app/out.txt", "--expect", text]),
        )
        .await
        .unwrap();
    }
    assert!(!std::path::Path::new("/app/out.txt").exists());
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn position_queries_track_reads() {
    let agent = AgentFixture::start().await.unwrap();
    run_ok(
        agent
            .layered(HELPER)
            .args(["seek", "/app/test.txt", "--expect", LOREM]),
    )
    .await
    .unwrap();
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_reports_remote_end() {
    let agent = AgentFixture::start().await.unwrap();
    fs::write(agent.app_dir().join("log.txt"), "abc").unwrap();
    let stdout = run_ok(
        agent
            .layered(HELPER)
            .args(["append", "/app/log.txt", "--text", "def"]),
    )
    .await
    .unwrap();
    assert_eq!(stdout.trim(), "6");
    assert_eq!(fs::read_to_string(agent.app_dir().join("log.txt")).unwrap(), "abcdef");
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn access_is_answered_remotely() {
    let agent = AgentFixture::start().await.unwrap();
    for mode in [libc::F_OK, libc::R_OK, libc::R_OK | libc::W_OK] {
        run_ok(agent.layered(HELPER).args([
            "access",
            "/app/test.txt",
            "--mode",
            &mode.to_string(),
        ]))
        .await
        .unwrap();
    }
    run_ok(agent.layered(HELPER).args([
        "access",
        "/app/missing.txt",
        "--expect-errno",
        &libc::ENOENT.to_string(),
    ]))
    .await
    .unwrap();
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_listing_keeps_agent_order() {
    let agent = AgentFixture::start().await.unwrap();
    let stdout = run_ok(agent.layered(HELPER).args(["list", "/app"]))
        .await
        .unwrap();

    let listed: Vec<&str> = stdout.lines().collect();
    let native: Vec<String> = fs::read_dir(agent.app_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(listed, native);

    let mut sorted = listed.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec!["app.py", "test.txt"]);
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_scope_paths_pass_through() {
    let agent = AgentFixture::start().await.unwrap();
    let local = tempfile::tempdir().unwrap();
    let path = local.path().join("local.txt");
    fs::write(&path, SHORT_TEXT).unwrap();
    let path = path.to_str().unwrap();

    run_ok(
        agent
            .layered(HELPER)
            .args(["read", path, "--expect", SHORT_TEXT]),
    )
    .await
    .unwrap();
    run_ok(agent.layered(HELPER).args(["write", path, "--text", LOREM]))
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(path).unwrap(), LOREM);
    assert_eq!(agent.root().join("app").read_dir().unwrap().count(), 2);
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_agent_leaves_layer_inert() {
    let agent = AgentFixture::start().await.unwrap();
    let local = tempfile::tempdir().unwrap();
    let path = local.path().join("local.txt");
    fs::write(&path, SHORT_TEXT).unwrap();

    let mut cmd = agent.layered(HELPER);
    cmd.env("REMOTEFS_AGENT_SOCKET", local.path().join("nobody.sock"));
    run_ok(cmd.args(["read", path.to_str().unwrap(), "--expect", SHORT_TEXT]))
        .await
        .unwrap();

    // Without the agent `/app` is looked up locally, where it does not exist.
    let mut cmd = agent.layered(HELPER);
    cmd.env("REMOTEFS_AGENT_SOCKET", local.path().join("nobody.sock"));
    assert!(run_ok(cmd.args(["read", "/app/test.txt", "--expect", LOREM]))
        .await
        .is_err());
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_layer_does_not_redirect() {
    let agent = AgentFixture::start().await.unwrap();
    let mut cmd = agent.layered(HELPER);
    cmd.env("REMOTEFS_ENABLED", "0");
    assert!(run_ok(cmd.args(["read", "/app/test.txt", "--expect", LOREM]))
        .await
        .is_err());
    agent.stop().await;
}

#[tokio::test]
async fn bridge_without_library_is_a_no_op() {
    let local = tempfile::tempdir().unwrap();
    let path = local.path().join("local.txt");
    fs::write(&path, SHORT_TEXT).unwrap();

    let mut cmd = bare(HELPER);
    cmd.env("LD_PRELOAD", bridge_library());
    run_ok(cmd.args(["read", path.to_str().unwrap(), "--expect", SHORT_TEXT]))
        .await
        .unwrap();
}

#[tokio::test]
async fn bridge_survives_missing_library() {
    let local = tempfile::tempdir().unwrap();
    let path = local.path().join("local.txt");
    fs::write(&path, SHORT_TEXT).unwrap();

    let mut cmd = bare(HELPER);
    cmd.env("LD_PRELOAD", bridge_library())
        .env("REMOTEFS_BRIDGE_LIBRARY", local.path().join("libmissing.so"))
        .env("REMOTEFS_BRIDGE_LOG", "1")
        .args(["read", path.to_str().unwrap(), "--expect", SHORT_TEXT]);
    let output = cmd.output().await.unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("remotefs-bridge:"));
}
