//! Integration tests driving the `os-explode` binary.
//!
//! Only the commands that work on the storage root alone are exercised
//! here; the watch loop needs a live API server.

use std::path::Path;
use std::process::Command;

const DIGEST: &str = "sha256:abababababababababababababababababababababababababababababababab";

fn os_explode() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_os-explode"));
    for var in [
        "KUBERNETES_SERVICE_HOST",
        "KUBERNETES_SERVICE_PORT",
        "KUBERNETES_SERVICE_TOKEN",
        "OS_WATCH_NAMESPACE",
        "OSTREE_REPO_PATH",
        "OS_IMAGE_BLOB_SOURCE",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Lay out one reference pointing at a checked-out digest.
fn seed(root: &Path) {
    let link_dir = root.join("images/ns/app/v1");
    std::fs::create_dir_all(&link_dir).unwrap();
    std::fs::write(link_dir.join("link"), DIGEST).unwrap();
    std::fs::create_dir_all(root.join("images/ns/web/v1")).unwrap();

    let rootfs = root.join("digest/sha256").join(&DIGEST[7..]).join("rootfs");
    std::fs::create_dir_all(rootfs.join("etc")).unwrap();
    std::fs::write(rootfs.join("etc/hostname"), "app").unwrap();
}

#[test]
fn test_version() {
    let output = os_explode().arg("version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("os-explode version "));
}

#[test]
fn test_retire_removes_pointer_and_tree() {
    let tmp = tempfile::TempDir::new().unwrap();
    seed(tmp.path());

    let output = os_explode()
        .args(["retire", "ns/app/v1", "--storage-root"])
        .arg(tmp.path())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Retired: ns/app/v1"));

    assert!(!tmp.path().join("images/ns/app").exists());
    assert!(tmp.path().join("images/ns/web/v1").exists());
    assert!(!tmp.path().join("digest/sha256").exists());
    assert!(tmp.path().join("digest").exists());
}

#[test]
fn test_retire_keep_tree() {
    let tmp = tempfile::TempDir::new().unwrap();
    seed(tmp.path());

    let output = os_explode()
        .args(["retire", "ns/app/v1", "--keep-tree", "--storage-root"])
        .arg(tmp.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(!tmp.path().join("images/ns/app/v1/link").exists());
    assert!(tmp
        .path()
        .join("digest/sha256")
        .join(&DIGEST[7..])
        .join("rootfs/etc/hostname")
        .exists());
}

#[test]
fn test_retire_rejects_bad_reference() {
    let tmp = tempfile::TempDir::new().unwrap();
    let output = os_explode()
        .args(["retire", "not-a-reference", "--storage-root"])
        .arg(tmp.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

#[test]
fn test_watch_without_api_host_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let output = os_explode()
        .args(["watch", "--token", "t", "--storage-root"])
        .arg(tmp.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("KUBERNETES_SERVICE_HOST"));
}
