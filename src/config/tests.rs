use super::*;

#[test]
fn test_bm1880_defaults() {
    let config = TargetConfig::bm1880();
    assert_eq!(config.name, "bm1880");
    assert_eq!(config.march, March::Bm1880);
    assert!(config.quantized);
    assert_eq!(config.multiplier_bits, 16);
    assert_eq!(config.output_extension, ".s");
}

#[test]
fn test_resolve_builtins() {
    assert_eq!(TargetConfig::resolve("bm1880").unwrap().march, March::Bm1880);
    let float = TargetConfig::resolve("bm1680").unwrap();
    assert_eq!(float.march, March::Bm1680);
    assert!(!float.quantized);
}

#[test]
fn test_resolve_rejects_path_traversal() {
    for name in ["../etc/passwd", "./sneaky", "foo/bar", ".hidden", "a\\b", ""] {
        assert!(
            matches!(
                TargetConfig::resolve(name),
                Err(ConfigError::InvalidName { .. })
            ),
            "accepted {:?}",
            name
        );
    }
}

#[test]
fn test_resolve_unknown_target() {
    let err = TargetConfig::resolve("no_such_chip").unwrap_err();
    assert!(err.to_string().contains("targets/no_such_chip.toml"));
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge.toml");
    std::fs::write(
        &path,
        r#"
[target]
name = "edge"
display_name = "Edge int8"
march = "bm1880"
multiplier_bits = 12
"#,
    )
    .unwrap();
    let config = TargetConfig::load(&path).unwrap();
    assert_eq!(config.name, "edge");
    assert_eq!(config.display_name, "Edge int8");
    assert_eq!(config.march, March::Bm1880);
    assert!(config.quantized);
    assert_eq!(config.multiplier_bits, 12);
    assert_eq!(config.output_extension, ".s");
}

#[test]
fn test_load_rejects_bad_files() {
    let dir = tempfile::tempdir().unwrap();
    let bad_march = dir.path().join("a.toml");
    std::fs::write(&bad_march, "[target]\nname = \"a\"\nmarch = \"gpu\"\n").unwrap();
    assert!(matches!(
        TargetConfig::load(&bad_march),
        Err(ConfigError::Invalid { .. })
    ));

    let bad_bits = dir.path().join("b.toml");
    std::fs::write(
        &bad_bits,
        "[target]\nname = \"b\"\nmarch = \"bm1680\"\nmultiplier_bits = 40\n",
    )
    .unwrap();
    let err = TargetConfig::load(&bad_bits).unwrap_err();
    assert!(err.to_string().contains("multiplier_bits"));

    assert!(matches!(
        TargetConfig::load(&dir.path().join("missing.toml")),
        Err(ConfigError::Io { .. })
    ));
}
