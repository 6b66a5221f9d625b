//! Controller configuration from command line flags and environment

use std::path::{Path, PathBuf};

use clap::Parser;
use jsonwebtoken::DecodingKey;

use crate::cluster::ClonePodSettings;
use crate::error::{Error, Result};

const PULL_POLICIES: &[&str] = &["Always", "IfNotPresent", "Never"];

/// PVC clone controller
#[derive(Parser, Clone, Debug)]
#[command(name = "pvc-clone-controller", version, about)]
pub struct Config {
    /// Image run by the source and target clone pods
    #[arg(long, env = "CLONER_IMAGE", default_value = "kubevirt/cdi-cloner:latest")]
    pub clone_image: String,

    /// Image pull policy of the clone pods
    #[arg(long, env = "PULL_POLICY", default_value = "IfNotPresent", value_parser = parse_pull_policy)]
    pub pull_policy: String,

    /// Log verbosity passed to the clone pods
    #[arg(long, env = "VERBOSITY", default_value_t = 1)]
    pub verbose: u8,

    /// PEM public key verifying clone tokens signed by the API server
    #[arg(long, env = "APISERVER_PUBLIC_KEY", default_value = "/opt/cdi/apiserver/key/id_rsa.pub")]
    pub apiserver_public_key: PathBuf,

    /// Claims reconciled concurrently
    #[arg(long, env = "CLONE_WORKERS", default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Port of the metrics and health check server
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,
}

fn parse_pull_policy(value: &str) -> std::result::Result<String, String> {
    if PULL_POLICIES.contains(&value) {
        Ok(value.to_string())
    } else {
        Err(format!("expected one of {}", PULL_POLICIES.join(", ")))
    }
}

impl Config {
    /// Load the token verification key
    pub fn load_public_key(&self) -> Result<DecodingKey> {
        load_public_key(&self.apiserver_public_key)
    }

    pub fn pod_settings(&self) -> ClonePodSettings {
        ClonePodSettings {
            image: self.clone_image.clone(),
            pull_policy: self.pull_policy.clone(),
            verbose: self.verbose,
        }
    }
}

fn load_public_key(path: &Path) -> Result<DecodingKey> {
    let pem = std::fs::read(path)?;
    DecodingKey::from_rsa_pem(&pem).map_err(|e| {
        Error::config(format!(
            "invalid API server public key {}: {}",
            path.display(),
            e
        ))
    })
}
