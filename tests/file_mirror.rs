//! End-to-end mirroring between two local repositories through real `git upload-pack` and
//! `git receive-pack`. Skipped when `git` is not installed.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use git_relay::{Endpoint, Relay, RelayConfig, TracingSink};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args([
            "-c",
            "user.name=relay",
            "-c",
            "user.email=relay@example.com",
            "-c",
            "init.defaultBranch=main",
        ])
        .args(args)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn rev(dir: &Path, name: &str) -> Option<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(["rev-parse", "--verify", "--quiet", name])
        .output()
        .expect("run git");
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn file_endpoint(path: &Path) -> Endpoint {
    format!("file://{}", path.display()).parse().unwrap()
}

/// Creates, then leaves alone, then prunes refs on a bare target.
#[tokio::test]
async fn mirrors_between_local_repositories() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let target = dir.path().join("target.git");
    std::fs::create_dir(&source).unwrap();
    std::fs::create_dir(&target).unwrap();

    git(&source, &["init", "-q"]);
    std::fs::write(source.join("README"), "relay\n").unwrap();
    git(&source, &["add", "README"]);
    git(&source, &["commit", "-q", "-m", "first"]);
    git(&source, &["tag", "-a", "v0", "-m", "v0"]);
    git(&source, &["branch", "feature"]);
    git(&target, &["init", "-q", "--bare"]);

    let relay = Relay::new(RelayConfig::default(), Arc::new(TracingSink)).unwrap();
    let (from, to) = (file_endpoint(&source), file_endpoint(&target));

    let outcome = relay.run(&from, &to).await.unwrap();
    assert_eq!(outcome.updates.len(), 3, "{outcome:?}");
    assert_eq!(outcome.exit_code(), 0, "{outcome:?}");
    assert!(outcome.bytes_relayed > 0);
    for name in ["refs/heads/main", "refs/heads/feature", "refs/tags/v0"] {
        assert_eq!(rev(&target, name), rev(&source, name), "{name}");
    }
    git(&target, &["fsck", "--no-progress"]);

    let again = relay.run(&from, &to).await.unwrap();
    assert!(again.updates.is_empty());
    assert_eq!(again.bytes_relayed, 0);

    git(&source, &["branch", "-D", "feature"]);
    std::fs::write(source.join("README"), "relay, again\n").unwrap();
    git(&source, &["commit", "-q", "-am", "second"]);
    let outcome = relay.run(&from, &to).await.unwrap();
    assert_eq!(outcome.updates.len(), 2, "{outcome:?}");
    assert_eq!(outcome.exit_code(), 0, "{outcome:?}");
    assert_eq!(rev(&target, "refs/heads/feature"), None);
    assert_eq!(rev(&target, "refs/heads/main"), rev(&source, "refs/heads/main"));
}
