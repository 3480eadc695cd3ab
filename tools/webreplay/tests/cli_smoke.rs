use assert_cmd::cargo::cargo_bin_cmd;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/{path}", env!("CARGO_MANIFEST_DIR"))
}

fn stderr_of(out: &assert_cmd::assert::Assert) -> String {
    String::from_utf8(out.get_output().stderr.clone()).expect("utf8")
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("webreplay");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    for command in ["replay", "synthesize", "show", "import"] {
        assert!(stdout.contains(command), "missing {command}");
    }
    assert!(stdout.contains("--config"));
}

#[test]
fn import_then_show_round_trips_through_sqlite() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = temp.path().join("scripts.sqlite");

    let mut import = cargo_bin_cmd!("webreplay");
    import
        .current_dir(temp.path())
        .arg("import")
        .arg("--script")
        .arg("cart")
        .arg("--file")
        .arg(fixture("scripts/cart.json"))
        .arg("--database")
        .arg(&db);
    let out = import.assert().success();
    assert!(stderr_of(&out).contains("role=import state=complete message=script=cart id=1 events=3"));

    let mut show = cargo_bin_cmd!("webreplay");
    show.current_dir(temp.path())
        .arg("show")
        .arg("--script")
        .arg("cart")
        .arg("--database")
        .arg(&db);
    let out = show.assert().success();
    let stderr = stderr_of(&out);
    assert!(stderr.contains("cart (id 1) 3 events"));
    assert!(stderr.contains("url=http://shop.test/api/cart"));
    assert!(temp.path().join(".webreplay/logs/run.jsonl").exists());
}

#[test]
fn config_file_paths_are_used() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("webreplay");
    cmd.current_dir(temp.path())
        .arg("--config")
        .arg(fixture("configs/minimal.toml"))
        .arg("import")
        .arg("--script")
        .arg("cart")
        .arg("--file")
        .arg(fixture("scripts/cart.json"));
    cmd.assert().success();
    assert!(temp.path().join("scripts.sqlite").exists());
    assert!(temp.path().join("logs/run.jsonl").exists());
}

#[test]
fn missing_script_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("webreplay");
    cmd.current_dir(temp.path())
        .arg("show")
        .arg("--script")
        .arg("nope")
        .arg("--database")
        .arg(temp.path().join("scripts.sqlite"));
    let out = cmd.assert().failure().code(1);
    assert!(stderr_of(&out).contains("script not found: nope"));
}

#[test]
fn invalid_strategy_is_rejected_before_anything_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("webreplay");
    cmd.current_dir(temp.path())
        .arg("--config")
        .arg(fixture("configs/invalid-strategy.toml"))
        .arg("show")
        .arg("--script")
        .arg("cart");
    let out = cmd.assert().failure();
    assert!(stderr_of(&out).contains("replay.timing_strategy"));
    assert!(!temp.path().join(".webreplay").exists());
}

#[test]
fn malformed_config_is_reported() {
    let mut cmd = cargo_bin_cmd!("webreplay");
    cmd.arg("--config")
        .arg(fixture("configs/malformed.toml"))
        .arg("show")
        .arg("--script")
        .arg("cart");
    let out = cmd.assert().failure();
    assert!(stderr_of(&out).contains("config parse error"));
}

#[test]
fn unknown_subcommand_is_a_cli_error() {
    let mut cmd = cargo_bin_cmd!("webreplay");
    cmd.arg("record");
    let out = cmd.assert().failure();
    assert!(stderr_of(&out).contains("cli error"));
}
