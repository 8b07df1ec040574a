use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Registry snapshot returned by `GET /debug`.
///
/// `services` maps each registered hostname to the identity it reported;
/// `services_set` lists every registered identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub services: BTreeMap<String, String>,
    pub services_set: Vec<String>,
}

/// Health payload returned by `GET /health`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
