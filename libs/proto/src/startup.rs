//! Startup environment codec.
//!
//! The controller hands the agent its configuration through environment
//! variables holding JSON lists. Both sides use this module so the variable
//! names and encodings cannot drift apart.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::action::Action;
use crate::error::ProtoError;
use crate::probe::Probe;
use crate::task::Task;

pub const ACTION_ENV: &str = "KB_AGENT_ACTION";
pub const PROBE_ENV: &str = "KB_AGENT_PROBE";
pub const STREAMING_ENV: &str = "KB_AGENT_STREAMING";
pub const TASK_ENV: &str = "KB_AGENT_TASK";

/// Everything the agent is told about at process start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupConfig {
    pub actions: Vec<Action>,
    pub probes: Vec<Probe>,
    /// Names of actions that may be driven over the streaming protocol.
    pub streaming: Vec<String>,
    pub tasks: Vec<Task>,
}

/// Encodes actions, probes and streaming action names as environment
/// variables. Empty lists are omitted.
pub fn build_startup_envs(
    actions: &[Action],
    probes: &[Probe],
    streaming: &[String],
) -> Result<Vec<(String, String)>, ProtoError> {
    let mut envs = Vec::new();
    push_env(&mut envs, ACTION_ENV, actions)?;
    push_env(&mut envs, PROBE_ENV, probes)?;
    push_env(&mut envs, STREAMING_ENV, streaming)?;
    Ok(envs)
}

/// Encodes tasks as an environment variable.
pub fn build_task_env(tasks: &[Task]) -> Result<Option<(String, String)>, ProtoError> {
    let mut envs = Vec::new();
    push_env(&mut envs, TASK_ENV, tasks)?;
    Ok(envs.pop())
}

/// Decodes the startup configuration using `lookup` to read variables.
///
/// Missing or empty variables decode to empty lists. Actions are validated
/// individually; cross-action checks belong to the registry.
pub fn decode_startup_envs<F>(lookup: F) -> Result<StartupConfig, ProtoError>
where
    F: Fn(&str) -> Option<String>,
{
    let actions: Vec<Action> = decode_env(&lookup, ACTION_ENV)?;
    for action in &actions {
        action.validate()?;
    }
    Ok(StartupConfig {
        actions,
        probes: decode_env(&lookup, PROBE_ENV)?,
        streaming: decode_env(&lookup, STREAMING_ENV)?,
        tasks: decode_env(&lookup, TASK_ENV)?,
    })
}

fn push_env<T: Serialize>(
    envs: &mut Vec<(String, String)>,
    name: &str,
    items: &[T],
) -> Result<(), ProtoError> {
    if !items.is_empty() {
        envs.push((name.to_string(), serde_json::to_string(items)?));
    }
    Ok(())
}

fn decode_env<T, F>(lookup: &F, name: &str) -> Result<Vec<T>, ProtoError>
where
    T: DeserializeOwned,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).map_err(|source| ProtoError::Decode {
                name: name.to_string(),
                source,
            })
        }
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::action::ExecAction;

    fn lookup_from(envs: Vec<(String, String)>) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = envs.into_iter().collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_build_and_decode() {
        let actions = vec![Action {
            name: "dataDump".to_string(),
            exec: Some(ExecAction {
                commands: vec!["/bin/sh".to_string(), "-c".to_string()],
                args: vec!["mysqldump --all-databases".to_string()],
            }),
            ..Default::default()
        }];
        let probes = vec![Probe {
            action: "dataDump".to_string(),
            period_seconds: 5,
            ..Default::default()
        }];
        let streaming = vec!["dataDump".to_string()];

        let envs = build_startup_envs(&actions, &probes, &streaming).unwrap();
        assert_eq!(envs.len(), 3);

        let config = decode_startup_envs(lookup_from(envs)).unwrap();
        assert_eq!(config.actions, actions);
        assert_eq!(config.probes, probes);
        assert_eq!(config.streaming, streaming);
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn test_empty_lists_are_omitted() {
        let envs = build_startup_envs(&[], &[], &[]).unwrap();
        assert!(envs.is_empty());
        assert!(build_task_env(&[]).unwrap().is_none());

        let config = decode_startup_envs(|_| None).unwrap();
        assert_eq!(config, StartupConfig::default());
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = decode_startup_envs(|name| {
            (name == PROBE_ENV).then(|| "[{\"action\":".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(PROBE_ENV));
    }

    #[test]
    fn test_decode_rejects_invalid_action() {
        let err = decode_startup_envs(|name| {
            (name == ACTION_ENV).then(|| r#"[{"name":"broken"}]"#.to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ProtoError::InvalidAction { .. }));
    }

    proptest! {
        #[test]
        fn prop_probe_timings_survive_env_encoding(
            names in prop::collection::vec("[a-z][a-zA-Z0-9]{0,15}", 1..5),
            period in -5i32..600,
            report in prop::option::of(0i32..600),
        ) {
            let probes: Vec<Probe> = names
                .iter()
                .map(|name| Probe {
                    action: name.clone(),
                    period_seconds: period,
                    report_period_seconds: report,
                    ..Default::default()
                })
                .collect();
            let envs = build_startup_envs(&[], &probes, &names).unwrap();
            let config = decode_startup_envs(lookup_from(envs)).unwrap();

            prop_assert_eq!(&config.streaming, &names);
            for (decoded, original) in config.probes.iter().zip(&probes) {
                prop_assert_eq!(decoded.period(), original.period());
                prop_assert_eq!(decoded.report_period(), original.report_period());
                prop_assert!(decoded.report_period().map_or(true, |p| p >= decoded.period()));
            }
        }
    }
}
