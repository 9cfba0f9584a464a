//! Integration tests for type declarations and overrides.
//!
//! Tests explicit declarations, `_types` side-files (including those of
//! spliced files), validation, coercion of environment and command-line
//! overrides, and post-load validators.

use conftree::{Conf, ConfLoader, ErrorCode, SourceLoader, TypeKind, YamlSource};
use serde_json::{Value, json};
use std::path::Path;
use tempfile::TempDir;

fn batch_conf() -> Value {
    json!({
        "batch_size": 32,
        "samples_per_batch": {
            "labelled": 16,
            "gen": {"generator1": 8, "generator2": 8},
        },
    })
}

fn write_yaml(dir: &Path, name: &str, value: Value) {
    YamlSource
        .save(&dir.join(name), &value)
        .expect("Failed to write fixture");
}

/// Loader that never reads the process environment.
fn loader() -> ConfLoader {
    ConfLoader::new().env_vars(Vec::<(String, String)>::new())
}

/// The composed-files fixture: a base splicing `shallow`, plus alternatives.
fn composed_dir() -> TempDir {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    write_yaml(
        dir,
        "_base.yaml",
        json!({"conf_key": 123, "neural_net": {"_file": "shallow.yaml", "this key": "is overridden"}}),
    );
    write_yaml(dir, "shallow.yaml", json!({"num_outputs": 10, "layer_sizes": [20]}));
    write_yaml(
        dir,
        "deep.yaml",
        json!({"num_outputs": 10, "layer_sizes": [20, 15, 10, 15, 20]}),
    );
    write_yaml(dir, "refs.yaml", json!({"k1": {"_file": "v1.yaml"}}));
    write_yaml(dir, "v1.yaml", json!({"k2": "v2", "k3": {"k4": {"_file": "v4.yaml"}}}));
    write_yaml(dir, "v4.yaml", json!(4));

    write_yaml(dir, "_base_types.yaml", json!({"conf_key": "int", "neural_net": {"this key": "str"}}));
    write_yaml(dir, "shallow_types.yaml", json!({"num_outputs": "int", "layer_sizes": "list"}));
    write_yaml(dir, "v4_types.yaml", json!("int"));
    temp
}

mod declaration_tests {
    use super::*;

    #[test]
    fn test_explicit_declarations_merge() {
        let conf = loader()
            .conf(batch_conf())
            .types(json!({"batch_size": "int"}))
            .types(json!({"samples_per_batch": {"labelled": "int", "gen": {"generator1": "int"}}}))
            .types(json!({"samples_per_batch": {"gen": {"generator2": "integer"}}}))
            .load()
            .unwrap();

        assert_eq!(conf.get_type("batch_size"), Some(TypeKind::Int));
        assert_eq!(conf.get_type("samples_per_batch.labelled"), Some(TypeKind::Int));
        assert_eq!(conf.get_type("samples_per_batch.gen.generator1"), Some(TypeKind::Int));
        assert_eq!(conf.get_type("samples_per_batch.gen.generator2"), Some(TypeKind::Int));
        assert_eq!(conf.types().as_value()["batch_size"], json!("int"));
    }

    #[test]
    fn test_side_file_of_explicit_file() {
        let temp = TempDir::new().unwrap();
        write_yaml(temp.path(), "conf.yaml", batch_conf());
        write_yaml(
            temp.path(),
            "conf_types.yaml",
            json!({"samples_per_batch": {"gen": {"generator2": "float"}}}),
        );

        // the side-file declares a float where the file holds an int
        let err = loader()
            .conf_file(temp.path().join("conf.yaml"))
            .types(json!({"batch_size": "int"}))
            .load()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
        assert_eq!(err.key.as_deref(), Some("samples_per_batch.gen.generator2"));
    }

    #[test]
    fn test_side_files_of_spliced_files() {
        let temp = composed_dir();

        let conf = loader().conf_dir(temp.path()).load().unwrap();
        assert_eq!(conf.get_type("conf_key"), Some(TypeKind::Int));
        assert_eq!(conf.get_type("neural_net.this key"), Some(TypeKind::Str));
        assert_eq!(conf.get_type("neural_net.layer_sizes"), Some(TypeKind::List));

        let chained = loader()
            .conf_dir(temp.path())
            .overrides(json!({"neural_net._file": "refs.yaml"}))
            .load()
            .unwrap();
        // a scalar side-file declares the splice point itself
        assert_eq!(chained.get_type("neural_net.k1.k3.k4"), Some(TypeKind::Int));
        assert_eq!(chained.get_as::<i64>("neural_net.k1.k3.k4").unwrap(), 4);
    }

    #[test]
    fn test_spliced_side_file_is_validated() {
        let temp = composed_dir();
        write_yaml(temp.path(), "shallow_types.yaml", json!({"num_outputs": "str"}));

        let err = loader().conf_dir(temp.path()).load().unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
        assert_eq!(err.key.as_deref(), Some("neural_net.num_outputs"));

        // deep.yaml has no side-file, so nothing declares num_outputs
        let conf = loader()
            .conf_dir(temp.path())
            .overrides(json!({"neural_net._file": "deep.yaml"}))
            .load()
            .unwrap();
        assert_eq!(conf.get_as::<Vec<i64>>("neural_net.layer_sizes").unwrap().len(), 5);
    }

    #[test]
    fn test_invalid_kind_is_rejected() {
        let err = loader()
            .conf(batch_conf())
            .types(json!({"batch_size": "complex"}))
            .load()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTypeKind);
    }

    #[test]
    fn test_missing_types_are_inferred() {
        let conf = loader()
            .conf(json!({"name": "run", "rate": 0.5, "layers": [1], "on": true, "opt": null}))
            .load()
            .unwrap();
        assert_eq!(conf.get_type("name"), Some(TypeKind::Str));
        assert_eq!(conf.get_type("rate"), Some(TypeKind::Float));
        assert_eq!(conf.get_type("layers"), Some(TypeKind::List));
        assert_eq!(conf.get_type("on"), Some(TypeKind::Bool));
        assert_eq!(conf.get_type("opt"), Some(TypeKind::Null));

        conf.set("extra", 3).unwrap();
        assert_eq!(conf.get_type("extra"), None);
        assert_eq!(conf.set_missing_types().unwrap(), 1);
        assert_eq!(conf.get_type("extra"), Some(TypeKind::Int));
    }

    #[test]
    fn test_validate_after_set() {
        let conf = loader()
            .conf(batch_conf())
            .types(json!({"batch_size": "int"}))
            .load()
            .unwrap();
        conf.validate_types().unwrap();

        conf.set("batch_size", "many").unwrap();
        let err = conf.validate_types().unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
        assert!(err.message.contains("batch_size"), "{}", err.message);
    }
}

mod override_tests {
    use super::*;

    fn cli_conf() -> Value {
        json!({
            "k1": "v1",
            "k2": {"k3": "v3", "k4": {"k5": "v5", "k6": "v6", "k7": {"k8": 8}}},
        })
    }

    fn with_args(args: &[&str]) -> Conf {
        loader()
            .conf(cli_conf())
            .cli_args(args.iter().copied())
            .load()
            .unwrap()
    }

    #[test]
    fn test_cli_root_and_nested_keys() {
        let conf = with_args(&["--k1", "my_val", "--k2.k3=nested", "--k2__k4__k5", "escaped"]);
        assert_eq!(conf.get("k1").unwrap(), "my_val");
        assert_eq!(conf.get("k2.k3").unwrap(), "nested");
        assert_eq!(conf.get("k2.k4.k5").unwrap(), "escaped");
    }

    #[test]
    fn test_cli_type_conversion() {
        assert_eq!(with_args(&[]).get_as::<i64>("k2.k4.k7.k8").unwrap(), 8);
        assert_eq!(with_args(&["--k2.k4.k7.k8", "9"]).get("k2.k4.k7.k8").unwrap(), json!(9));
    }

    #[test]
    fn test_cli_declared_type() {
        let conf = loader()
            .conf(json!({"lr": 1}))
            .types(json!({"lr": "float"}))
            .cli_args(["--lr=0.5"])
            .load()
            .unwrap();
        assert_eq!(conf.get_as::<f64>("lr").unwrap(), 0.5);

        let err = loader()
            .conf(json!({"lr": 1.0}))
            .types(json!({"lr": "float"}))
            .cli_args(["--lr=fast"])
            .load()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOverride);
    }

    #[test]
    fn test_cli_value_below_spliced_file() {
        let temp = composed_dir();
        let conf = loader()
            .conf_dir(temp.path())
            .cli_args(["--neural_net._file=deep", "--neural_net.num_outputs=3"])
            .load()
            .unwrap();
        assert_eq!(conf.get("neural_net.num_outputs").unwrap(), json!(3));
        assert_eq!(conf.get_as::<Vec<i64>>("neural_net.layer_sizes").unwrap().len(), 5);
    }

    #[test]
    fn test_env_overrides() {
        let conf = ConfLoader::new()
            .conf(cli_conf())
            .env_vars([
                ("CONFTREE_k2__k4__k7__k8", "12"),
                ("CONFTREE_k1", "from_env"),
                ("CONFTREE_CONF_DIR", "elsewhere"),
                ("PATH", "/usr/bin"),
            ])
            .load()
            .unwrap();
        assert_eq!(conf.get("k2.k4.k7.k8").unwrap(), json!(12));
        assert_eq!(conf.get("k1").unwrap(), "from_env");
        assert!(!conf.contains("CONF_DIR"));
    }

    #[test]
    fn test_cli_wins_over_env() {
        let conf = ConfLoader::new()
            .conf(cli_conf())
            .env_vars([("CONFTREE_k1", "from_env")])
            .cli_args(["--k1=from_cli"])
            .load()
            .unwrap();
        assert_eq!(conf.get("k1").unwrap(), "from_cli");
    }
}

mod validator_tests {
    use super::*;

    /// Batch size must equal the sum of its per-source samples.
    fn validate_batch_size(conf: &Conf) -> anyhow::Result<()> {
        let batch_size: i64 = conf.get_as("batch_size")?;
        let labelled: i64 = conf.get_as("samples_per_batch.labelled")?;
        let generated: Vec<i64> = conf
            .get_as::<serde_json::Map<String, Value>>("samples_per_batch.gen")?
            .values()
            .filter_map(Value::as_i64)
            .collect();
        let total = labelled + generated.iter().sum::<i64>();
        anyhow::ensure!(
            batch_size == total,
            "batch_size {} does not match {} samples per batch",
            batch_size,
            total
        );
        Ok(())
    }

    #[test]
    fn test_validator_passes() {
        loader()
            .conf(batch_conf())
            .validator(validate_batch_size)
            .load()
            .unwrap();
    }

    #[test]
    fn test_validator_failure_names_validator() {
        let err = loader()
            .conf(batch_conf())
            .overrides(json!({"batch_size": 30}))
            .validator(|_: &Conf| Ok(()))
            .validator(validate_batch_size)
            .load()
            .unwrap_err();
        assert_eq!(err.details.as_deref(), Some("validator #1"));
        assert!(err.message.contains("does not match"), "{}", err.message);
    }
}
