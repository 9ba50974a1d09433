use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::config::VastConfig;
use crate::errors::VastError;
use crate::ssh::SshEndpoint;

/// Host side of a Docker port mapping as reported under `ports`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    #[serde(rename = "HostIp", default)]
    pub host_ip: Option<String>,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

/// A rented instance (subset of the fields the API returns).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: u64,
    #[serde(default)]
    pub actual_status: Option<String>,
    #[serde(default)]
    pub intended_status: Option<String>,
    #[serde(default)]
    pub status_msg: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub num_gpus: Option<u32>,
    #[serde(default)]
    pub dph_total: Option<f64>,
    #[serde(default)]
    pub image_uuid: Option<String>,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub public_ipaddr: Option<String>,
    #[serde(default)]
    pub ports: Option<HashMap<String, Vec<PortMapping>>>,
    #[serde(default)]
    pub start_date: Option<f64>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.actual_status.as_deref() == Some("running")
    }

    /// SSH endpoint for the instance: the proxy `ssh_host:ssh_port` when
    /// present, otherwise the public IP with the host port mapped to `22/tcp`.
    pub fn ssh_endpoint(
        &self,
        user: &str,
        identity_file: Option<PathBuf>,
    ) -> Result<SshEndpoint, VastError> {
        let direct = || {
            let ip = self.public_ipaddr.as_deref()?.trim();
            let port = self
                .ports
                .as_ref()?
                .get("22/tcp")?
                .first()?
                .host_port
                .parse()
                .ok()?;
            Some((ip.to_string(), port))
        };

        let (host, port) = match (&self.ssh_host, self.ssh_port) {
            (Some(host), Some(port)) if !host.is_empty() => (host.clone(), port),
            _ => direct().ok_or(VastError::NoSshEndpoint { id: self.id })?,
        };

        Ok(SshEndpoint {
            identity_file,
            ..SshEndpoint::new(host, port, user)
        })
    }
}

/// A rentable machine offer from `/bundles/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub id: u64,
    #[serde(default)]
    pub machine_id: Option<u64>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub num_gpus: Option<u32>,
    /// MB.
    #[serde(default)]
    pub gpu_ram: Option<f64>,
    #[serde(default)]
    pub dph_total: Option<f64>,
    #[serde(default)]
    pub reliability2: Option<f64>,
    #[serde(default)]
    pub inet_down: Option<f64>,
    #[serde(default)]
    pub inet_up: Option<f64>,
    #[serde(default)]
    pub disk_space: Option<f64>,
    #[serde(default)]
    pub cuda_max_good: Option<f64>,
    #[serde(default)]
    pub geolocation: Option<String>,
    #[serde(default)]
    pub verified: Option<bool>,
}

/// Body of `PUT /asks/{offer_id}/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateInstance {
    pub image: String,
    pub disk: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Environment variables and `-p host:container` port flags.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onstart: Option<String>,
    #[serde(default = "default_runtype")]
    pub runtype: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_runtype() -> String {
    "ssh".to_string()
}

fn default_client_id() -> String {
    "me".to_string()
}

impl CreateInstance {
    pub fn new(image: impl Into<String>, disk: f64) -> Self {
        Self {
            image: image.into(),
            disk,
            label: None,
            env: BTreeMap::new(),
            onstart: None,
            runtype: default_runtype(),
            client_id: default_client_id(),
        }
    }

    /// Request prefilled from the `[vast]` section.
    pub fn from_config(config: &VastConfig) -> Self {
        Self {
            onstart: config.onstart.clone(),
            ..Self::new(config.image.clone(), config.disk_gb)
        }
    }

    /// Publish a container port on the same host port.
    pub fn expose_port(&mut self, port: u16) {
        self.env.insert(format!("-p {}:{}", port, port), "1".to_string());
    }
}
