use std::process::Command;

#[test]
fn test_missing_config_exits_with_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_ino-host"))
        .arg("/nonexistent/printer.toml")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Failed to read config file"), "{}", stdout);
}
