use std::time::Duration;

use crate::config::FotaConfig;
use crate::fota::Fota;
use crate::shell::{execute, ShellStatus};
use crate::tests::mocks::*;

fn fota_with(http: ScriptedHttp, start: bool) -> Fota {
    let device = RecordingDevice::default();
    let config = FotaConfig {
        http_timeout_ms: 300,
        reboot_delay_ms: 10,
        ..FotaConfig::default()
    };
    let fota = Fota::new(config, collaborators(&device, http)).unwrap();
    if start {
        fota.start().unwrap();
    }
    fota
}

fn run(fota: &Fota, line: &str) -> (ShellStatus, String) {
    let mut out = String::new();
    let status = execute(fota, line, &mut out);
    (status, out)
}

#[test]
fn test_fota_http_requires_a_started_module() {
    let fota = fota_with(ScriptedHttp::silent(), false);
    let (status, out) = run(&fota, "fota_http 10.0.0.1 8000 /image.ota");
    assert_eq!(status, ShellStatus::Error);
    assert!(out.contains("not started"));
}

#[test]
fn test_fota_http_argument_checks() {
    let fota = fota_with(ScriptedHttp::silent(), true);

    assert_eq!(run(&fota, "fota_http 10.0.0.1 8000").0, ShellStatus::UnknownArgs);
    assert_eq!(run(&fota, "fota_http 10.0.0.1 http /a").0, ShellStatus::UnknownArgs);
    assert_eq!(run(&fota, "fota_http 10.0.0.1 70000 /a").0, ShellStatus::UnknownArgs);

    let long_uri = format!("fota_http 10.0.0.1 8000 /{}", "a".repeat(300));
    assert_eq!(run(&fota, &long_uri).0, ShellStatus::UnknownArgs);
}

#[test]
fn test_fota_http_success_uses_the_given_parameters() {
    let http = ScriptedHttp::serving(200, vec![0x5a; 768], 256);
    let fota = fota_with(http.clone(), true);

    let (status, out) = run(&fota, "fota_http fw.local 8080 /download/ncp.ota");
    // fw.local is unknown to the static resolver
    assert_eq!(status, ShellStatus::Error);
    assert!(out.contains("ERROR"));
    assert!(http.requests().is_empty());

    let (status, out) = run(&fota, "fota_http 10.0.0.7 8080 /download/ncp.ota");
    assert_eq!(status, ShellStatus::Ok);
    assert!(out.contains("SUCCESS"));

    let request = &http.requests()[0];
    assert_eq!(request.url(), "http://10.0.0.7:8080/download/ncp.ota");
    assert_eq!(fota.parameters().port, 8080);
}

#[test]
fn test_fota_http_reports_failure() {
    let fota = fota_with(ScriptedHttp::response_error(-3), true);
    let (status, _) = run(&fota, "fota_http 10.0.0.1 8000 /image.ota");
    assert_eq!(status, ShellStatus::Error);
}

#[test]
fn test_fota_timer_command() {
    let fota = fota_with(ScriptedHttp::silent(), true);

    assert_eq!(run(&fota, "fota_timer").0, ShellStatus::UnknownArgs);
    assert_eq!(run(&fota, "fota_timer soon").0, ShellStatus::UnknownArgs);
    assert_eq!(run(&fota, "fota_timer 0").0, ShellStatus::UnknownArgs);

    assert_eq!(run(&fota, "fota_timer 600000").0, ShellStatus::Ok);
    assert!(fota.timer_running());
    assert_eq!(fota.timer_period(), Some(Duration::from_secs(600)));
}

#[test]
fn test_status_skip_and_help() {
    let fota = fota_with(ScriptedHttp::silent(), true);

    let (status, out) = run(&fota, "fota_status");
    assert_eq!(status, ShellStatus::Ok);
    assert!(out.contains("READY"));
    assert!(out.contains("192.168.8.105:8000"));
    assert!(out.contains("not configured"));

    assert_eq!(run(&fota, "fota_skip").0, ShellStatus::Ok);

    let (status, out) = run(&fota, "help");
    assert_eq!(status, ShellStatus::Ok);
    assert!(out.contains("fota_http <server> <port> <uri>"));

    assert_eq!(run(&fota, "reboot_now").0, ShellStatus::UnknownCommand);
    assert_eq!(run(&fota, "   ").0, ShellStatus::Ok);
}
