//! Tests for the launcher's pure pieces: resolv.conf rendering, PATH
//! lookup, user resolution, and the sysctl policy it enforces.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use bodman::launcher::{lookpath, render_resolv_conf, resolve_user};
use bodman::sysctl::{self, NamespaceModes};
use tempfile::TempDir;

// =============================================================================
// resolv.conf Rendering Tests
// =============================================================================

#[test]
fn test_full_resolv_conf() {
    let rendered = render_resolv_conf(
        &["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        &["corp".to_string(), "example.com".to_string()],
        &["ndots:2".to_string()],
    );
    assert_eq!(
        rendered,
        "search corp example.com\nnameserver 1.1.1.1\nnameserver 8.8.8.8\noptions ndots:2\n"
    );
}

#[test]
fn test_search_omitted_when_empty_or_dot() {
    assert_eq!(
        render_resolv_conf(&["8.8.8.8".to_string()], &[], &[]),
        "nameserver 8.8.8.8\n"
    );
    assert_eq!(
        render_resolv_conf(&["8.8.8.8".to_string()], &[".".to_string()], &[]),
        "nameserver 8.8.8.8\n"
    );
}

#[test]
fn test_options_omitted_when_blank() {
    assert_eq!(
        render_resolv_conf(&["9.9.9.9".to_string()], &[], &[" ".to_string()]),
        "nameserver 9.9.9.9\n"
    );
}

// =============================================================================
// PATH Lookup Tests
// =============================================================================

fn executable_in(dir: &std::path::Path, name: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, b"#!/bin/sh\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn test_lookpath_searches_env_path_in_order() {
    let temp = TempDir::new().unwrap();
    let a = temp.path().join("a");
    let b = temp.path().join("b");
    fs::create_dir_all(&a).unwrap();
    fs::create_dir_all(&b).unwrap();
    executable_in(&a, "prog");
    executable_in(&b, "prog");

    let env = vec![format!("PATH={}:{}", a.display(), b.display())];
    assert_eq!(lookpath("prog", &env).unwrap(), a.join("prog").to_string_lossy());
}

#[test]
fn test_lookpath_last_path_entry_in_env_wins() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("bin")).unwrap();
    executable_in(&temp.path().join("bin"), "prog");

    let env = vec![
        "PATH=/nonexistent".to_string(),
        format!("PATH={}", temp.path().join("bin").display()),
    ];
    assert!(lookpath("prog", &env).is_ok());
}

#[test]
fn test_lookpath_empty_path_entry_means_cwd() {
    let temp = TempDir::new().unwrap();
    executable_in(temp.path(), "here");
    let original = std::env::current_dir().unwrap();
    std::env::set_current_dir(temp.path()).unwrap();
    let result = lookpath("here", &["PATH=".to_string()]);
    std::env::set_current_dir(original).unwrap();
    assert_eq!(result.unwrap(), "./here");
}

#[test]
fn test_lookpath_absolute_name_bypasses_path() {
    let temp = TempDir::new().unwrap();
    let direct = executable_in(temp.path(), "direct");
    assert_eq!(lookpath(&direct, &[]).unwrap(), direct);
}

#[test]
fn test_lookpath_misses_report_not_found() {
    let err = lookpath("definitely-not-a-real-binary", &["PATH=/nonexistent".to_string()])
        .unwrap_err();
    assert!(err.to_string().contains("executable not found"));
}

// =============================================================================
// User Resolution Tests
// =============================================================================

#[test]
fn test_user_by_name_and_by_uid() {
    assert_eq!(resolve_user("root").unwrap().as_raw(), 0);
    assert_eq!(resolve_user("4242").unwrap().as_raw(), 4242);
    assert!(resolve_user("not-a-user-or-number").is_err());
}

// =============================================================================
// Sysctl Policy Tests
// =============================================================================

fn sysctls(spec: &str) -> Vec<bodman::sysctl::Sysctl> {
    sysctl::parse(&[spec.to_string()]).unwrap()
}

#[test]
fn test_ipc_kernel_sysctl_accepted() {
    sysctl::validate(&sysctls("kernel.msgmax=65536"), NamespaceModes::default()).unwrap();
}

#[test]
fn test_hostname_sysctl_rejected_with_host_uts() {
    let modes = NamespaceModes {
        host_uts: true,
        ..Default::default()
    };
    let err = sysctl::validate(&sysctls("kernel.hostname=x"), modes).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("ignored"), "{}", msg);
    assert!(msg.contains("UTS Namespace set to host"), "{}", msg);
}

#[test]
fn test_net_sysctl_rejected_with_host_network() {
    let modes = NamespaceModes {
        host_network: true,
        ..Default::default()
    };
    let err = sysctl::validate(&sysctls("net.ipv4.ip_forward=1"), modes).unwrap_err();
    assert!(err.to_string().contains("Network Namespace set to host"));
}

#[test]
fn test_non_namespaced_sysctl_disallowed() {
    let err =
        sysctl::validate(&sysctls("vm.swappiness=10"), NamespaceModes::default()).unwrap_err();
    assert!(err.to_string().contains("invalid sysctl"));
}
