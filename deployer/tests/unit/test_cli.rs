//! Command line contract tests

use tokio_test::{assert_err, assert_ok};

use nixdeploy::app::cli::{parse_command, request_from_flags, Command};
use nixdeploy::errors::DeployError;
use nixdeploy::eval::EvalResult;
use nixdeploy::models::request::{ActivationAction, DeployRequest, RetentionPolicy};
use nixdeploy::models::secrets::SecretBundle;

use crate::common::{DRV, OUT};

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_positional_contract() {
    let positional = args(&[
        DRV,
        OUT,
        "deploy@example.org",
        "2222",
        "false",
        r#"{"wg-key": "abc"}"#,
        "test",
        "+3 14d",
        "true",
        "false",
        "--option",
        "cores",
        "4",
    ]);
    let Command::Positional(rest) = parse_command(&[vec!["run".to_string()], positional].concat())
    else {
        panic!("expected positional command");
    };

    let request = assert_ok!(DeployRequest::from_positional(&rest));
    assert_eq!(request.build_plan, DRV);
    assert_eq!(request.output_path.as_deref(), Some(OUT));
    assert_eq!(request.target.user, "deploy");
    assert_eq!(request.target.host, "example.org");
    assert_eq!(request.target.port, 2222);
    assert_eq!(request.secrets.len(), 1);
    assert_eq!(request.action, ActivationAction::Test);
    assert_eq!(
        request.retention,
        RetentionPolicy::Delete(vec!["+3".to_string(), "14d".to_string()])
    );
    assert!(request.perform_gc);
    assert_eq!(request.extra_build_options, args(&["--option", "cores", "4"]));
}

#[test]
fn test_positional_contract_rejects_short_input() {
    let err = assert_err!(DeployRequest::from_positional(&args(&[DRV, OUT, "root@h"])));
    assert!(matches!(err, DeployError::ValidationError(_)));
}

#[test]
fn test_positional_contract_rejects_bad_action() {
    let positional = args(&[
        DRV, OUT, "root@h", "22", "false", "{}", "reboot", "+1", "true", "false",
    ]);
    assert_err!(DeployRequest::from_positional(&positional));
}

#[test]
fn test_named_flags_with_evaluation() {
    let cli = match parse_command(&args(&[
        "deploy",
        "--target=root@10.0.0.5",
        "--action=dry-activate",
        "--",
        "--max-jobs",
        "2",
    ])) {
        Command::Deploy(cli) => cli,
        other => panic!("unexpected command: {other:?}"),
    };
    let eval = EvalResult {
        drv_path: DRV.to_string(),
        out_path: OUT.to_string(),
        substituters: "https://cache.example.org".to_string(),
        trusted_public_keys: "cache.example.org-1:abc=".to_string(),
        current_system: "x86_64-linux".to_string(),
    };

    let request = assert_ok!(request_from_flags(&cli, Some(&eval), SecretBundle::new()));
    assert_eq!(request.build_plan, DRV);
    assert_eq!(request.output_path.as_deref(), Some(OUT));
    assert_eq!(request.local_system, "x86_64-linux");
    assert_eq!(request.action, ActivationAction::DryActivate);
    assert!(request.perform_gc);
    assert_eq!(
        request.retention,
        RetentionPolicy::Delete(vec!["+1".to_string()])
    );
    assert!(request
        .extra_build_options
        .windows(2)
        .any(|w| w == ["extra-substituters", "https://cache.example.org"]));
    assert_eq!(
        request.extra_build_options[request.extra_build_options.len() - 2..],
        ["--max-jobs", "2"]
    );
}

#[test]
fn test_named_flags_require_a_build_plan() {
    let Command::Deploy(cli) = parse_command(&args(&["deploy", "--target=root@h"])) else {
        panic!("expected deploy command");
    };
    assert_err!(request_from_flags(&cli, None, SecretBundle::new()));
}
