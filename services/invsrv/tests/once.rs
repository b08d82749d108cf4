//! `invsrv --once` against a loopback Solarman logger
//!
//! The binary's stdout must stay machine-readable: log lines, including
//! per-field decode warnings, go to stderr.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::process::Output;
use std::time::Duration;

use invsrv::test_utils::FakeLogger;

const SERIAL: u32 = 2_712_345_678;

async fn run_once(logger: &FakeLogger, extra_args: &[&str]) -> Output {
    let command = tokio::process::Command::new(env!("CARGO_BIN_EXE_invsrv"))
        .arg("--once")
        .arg("--no-color")
        .args(extra_args)
        .env_clear()
        .env("INVSRV_DEVICE__ADDRESS", "127.0.0.1")
        .env("INVSRV_DEVICE__PORT", logger.port().to_string())
        .env("INVSRV_DEVICE__SERIAL", SERIAL.to_string())
        .env("INVSRV_DEVICE__MAX_ATTEMPTS", "1")
        .env("INVSRV_DEVICE__CONNECT_TIMEOUT_SECS", "5")
        .env("INVSRV_DEVICE__READ_TIMEOUT_SECS", "5")
        .output();
    tokio::time::timeout(Duration::from_secs(30), command)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_once_stdout_is_json_when_a_field_fails() {
    // 6 is not a known inverter state, so overall_state fails to decode
    let logger = FakeLogger::start(SERIAL, &[(59, 6), (184, 87), (194, 1)])
        .await
        .unwrap();

    let output = run_once(&logger, &[]).await;
    let stdout = String::from_utf8(output.stdout).unwrap();
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(output.status.success(), "stderr: {}", stderr);

    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["battery_soc"], 87);
    assert_eq!(payload["grid_connection"], "ON");
    assert!(payload.get("overall_state").is_none());
    assert!(stderr.contains("[WARN]"));
    assert!(stderr.contains("Skipping register 59"));
}

#[tokio::test]
async fn test_once_debug_logging_stays_off_stdout() {
    let logger = FakeLogger::start(SERIAL, &[(59, 2), (184, 87)]).await.unwrap();

    let output = run_once(&logger, &["--log-level", "debug"]).await;
    let stdout = String::from_utf8(output.stdout).unwrap();
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(output.status.success(), "stderr: {}", stderr);

    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["overall_state"], "ok");
    assert!(stderr.contains("[DEBUG]"));
    assert!(!stdout.contains("[DEBUG]"));
}
