// Environment Partitioning
// Splits a container's env between the credential carrier and direct cluster references

use crate::models::EnvValue;

use k8s_openapi::api::core::v1::{ConfigMapKeySelector, EnvVar, EnvVarSource, SecretKeySelector};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

/// Where literal values end up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiteralMode {
    /// Written to the carrier and referenced through `secretKeyRef`
    #[default]
    Carrier,
    /// Set directly on the container
    Inline,
}

/// Accumulates carrier data while containers' env lists are produced
#[derive(Debug, Default)]
pub struct EnvPartitioner {
    carrier: String,
    mode: LiteralMode,
    data: BTreeMap<String, ByteString>,
}

impl EnvPartitioner {
    pub fn new(carrier: impl Into<String>, mode: LiteralMode) -> Self {
        Self {
            carrier: carrier.into(),
            mode,
            data: BTreeMap::new(),
        }
    }

    /// Store a raw entry in the carrier (scripts, sidecar credentials)
    pub fn store(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), ByteString(value.into().into_bytes()));
    }

    /// Env vars for one container. `prefix` namespaces the carrier keys of sidecars.
    pub fn container_env(
        &mut self,
        prefix: Option<&str>,
        env: &BTreeMap<String, EnvValue>,
    ) -> Vec<EnvVar> {
        env.iter()
            .map(|(name, value)| match value {
                EnvValue::Literal(literal) => self.literal(prefix, name, literal),
                EnvValue::SecretRef { name: secret, key } => EnvVar {
                    name: name.clone(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: Some(secret.clone()),
                            key: key.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                EnvValue::ConfigMapRef { name: map, key } => EnvVar {
                    name: name.clone(),
                    value_from: Some(EnvVarSource {
                        config_map_key_ref: Some(ConfigMapKeySelector {
                            name: Some(map.clone()),
                            key: key.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            })
            .collect()
    }

    fn literal(&mut self, prefix: Option<&str>, name: &str, value: &str) -> EnvVar {
        if self.mode == LiteralMode::Inline {
            return EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            };
        }

        let key = match prefix {
            Some(prefix) => format!("{}.{}", prefix, name),
            None => name.to_string(),
        };
        self.store(key.clone(), value);

        EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(self.carrier.clone()),
                    key,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Carrier data collected so far
    pub fn into_data(self) -> BTreeMap<String, ByteString> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entries: &[(&str, EnvValue)]) -> BTreeMap<String, EnvValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_literals_go_through_carrier() {
        let mut partitioner = EnvPartitioner::new("build-run1", LiteralMode::Carrier);
        let vars = partitioner.container_env(None, &env(&[("GREETING", "hello".into())]));

        let selector = vars[0]
            .value_from
            .as_ref()
            .and_then(|s| s.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(selector.name.as_deref(), Some("build-run1"));
        assert_eq!(selector.key, "GREETING");
        assert!(vars[0].value.is_none());

        let data = partitioner.into_data();
        assert_eq!(data["GREETING"], ByteString(b"hello".to_vec()));
    }

    #[test]
    fn test_references_bypass_carrier() {
        let mut partitioner = EnvPartitioner::new("build-run1", LiteralMode::Carrier);
        let vars = partitioner.container_env(
            None,
            &env(&[
                ("TOKEN", EnvValue::secret("creds", "token")),
                ("LEVEL", EnvValue::config_map("settings", "level")),
            ]),
        );

        let level = vars.iter().find(|v| v.name == "LEVEL").unwrap();
        let map_ref = level
            .value_from
            .as_ref()
            .and_then(|s| s.config_map_key_ref.as_ref())
            .unwrap();
        assert_eq!(map_ref.name.as_deref(), Some("settings"));

        let token = vars.iter().find(|v| v.name == "TOKEN").unwrap();
        let secret_ref = token
            .value_from
            .as_ref()
            .and_then(|s| s.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(secret_ref.name.as_deref(), Some("creds"));

        assert!(partitioner.into_data().is_empty());
    }

    #[test]
    fn test_sidecar_keys_are_prefixed() {
        let mut partitioner = EnvPartitioner::new("c", LiteralMode::Carrier);
        partitioner.container_env(Some("db"), &env(&[("PASSWORD", "pw".into())]));

        assert!(partitioner.into_data().contains_key("db.PASSWORD"));
    }

    #[test]
    fn test_inline_mode_skips_carrier() {
        let mut partitioner = EnvPartitioner::new("c", LiteralMode::Inline);
        let vars = partitioner.container_env(None, &env(&[("MODE", "fast".into())]));

        assert_eq!(vars[0].value.as_deref(), Some("fast"));
        assert!(vars[0].value_from.is_none());
        assert!(partitioner.into_data().is_empty());
    }
}
