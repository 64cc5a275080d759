use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn rpr(data_dir: &Path, args: &[&str]) -> TestResult<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_rpr"))
        .args(args)
        .env("RPR_DATA_DIR", data_dir)
        .env_remove("RPR_LOG")
        .env("NO_COLOR", "1")
        .output()?)
}

fn rpr_ok(data_dir: &Path, args: &[&str]) -> TestResult<String> {
    let out = rpr(data_dir, args)?;
    if !out.status.success() {
        return Err(format!(
            "rpr {:?} failed: {}\n{}",
            args,
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        )
        .into());
    }
    Ok(String::from_utf8(out.stdout)?)
}

#[test]
fn first_run_creates_owner_only_key_material() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path().join("data");

    let stdout = rpr_ok(&data, &["list"])?;
    assert!(stdout.contains("Nothing enrolled"));

    let keys: Value = serde_json::from_str(&std::fs::read_to_string(data.join("keys.json"))?)?;
    assert!(keys["api_token"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(keys["encryption_key"].as_str().is_some_and(|k| !k.is_empty()));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(data.join("keys.json"))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // Reopening keeps the same material.
    rpr_ok(&data, &["list"])?;
    let again: Value = serde_json::from_str(&std::fs::read_to_string(data.join("keys.json"))?)?;
    assert_eq!(keys, again);
    Ok(())
}

#[test]
fn enrollment_round_trip_keeps_secrets_encrypted() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path();

    rpr_ok(data, &["repo", "add", "https://github.com/octo/app.git", "--branch", "dev"])?;
    rpr_ok(data, &["server", "add", "web1.example.com", "--user", "deploy"])?;
    rpr_ok(
        data,
        &[
            "command",
            "add",
            "--repo",
            "octo/app",
            "--server",
            "web1.example.com",
            "--secret",
            "DEPLOY_TOKEN=abcdef123",
            "make deploy",
        ],
    )?;

    let listing: Value = serde_json::from_str(&rpr_ok(data, &["list", "--json"])?)?;
    assert_eq!(listing["repos"][0]["name"], "octo/app");
    assert_eq!(listing["repos"][0]["branch"], "dev");
    assert_eq!(listing["servers"][0]["state"], "reachable");
    assert_eq!(listing["commands"][0]["command"], "make deploy");
    assert_eq!(listing["commands"][0]["masked"]["DEPLOY_TOKEN"], "********123");

    for file in ["config.json", "secrets.json"] {
        let raw = std::fs::read_to_string(data.join(file))?;
        assert!(!raw.contains("abcdef123"), "{file} leaks plaintext");
    }

    let id = listing["commands"][0]["id"].as_str().ok_or("missing id")?.to_string();
    rpr_ok(data, &["command", "remove", &id])?;
    let secrets: Value = serde_json::from_str(&std::fs::read_to_string(data.join("secrets.json"))?)?;
    assert_eq!(secrets.as_array().map(Vec::len), Some(0));

    let activity = rpr_ok(data, &["logs", "activity", "-n", "50"])?;
    assert!(activity.contains("octo/app"));
    Ok(())
}

#[test]
fn duplicate_and_invalid_input_fail() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path();

    rpr_ok(data, &["repo", "add", "octo/app"])?;
    assert!(!rpr(data, &["repo", "add", "octo/app"])?.status.success());
    assert!(!rpr(data, &["repo", "add", "not a repo"])?.status.success());
    assert!(!rpr(data, &["run", "does-not-exist"])?.status.success());
    Ok(())
}

#[test]
fn corrupt_key_material_is_fatal_and_preserved() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path();
    std::fs::write(data.join("keys.json"), "{\"api_token\": 1}")?;

    let out = rpr(data, &["daemon"])?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("keys.json"));
    assert_eq!(
        std::fs::read_to_string(data.join("keys.json"))?,
        "{\"api_token\": 1}"
    );
    Ok(())
}
