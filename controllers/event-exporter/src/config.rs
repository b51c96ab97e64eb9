//! Command-line configuration.
//!
//! Every flag can be given on the command line; the kubeconfig path and
//! the watched namespace also fall back to the environment.

use crate::error::ConfigError;
use crate::filter::FilterConfig;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Exports Kubernetes Events matching the configured allow-lists to stdout.
#[derive(Parser, Debug, Clone)]
#[command(name = "event-exporter")]
#[command(version)]
pub struct Config {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Address of the Kubernetes API server. Overrides the kubeconfig value.
    #[arg(long)]
    pub master: Option<String>,

    /// Comma-separated event types to export (e.g. "Warning,Normal"); empty exports all
    #[arg(long, default_value = "")]
    pub types: String,

    /// Comma-separated involved object kinds to export; empty exports all
    #[arg(long = "involved-objects", alias = "involvedObjects", default_value = "")]
    pub involved_objects: String,

    /// Comma-separated event reasons to export; empty exports all
    #[arg(long, default_value = "")]
    pub reasons: String,

    /// Number of concurrent workers
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub threadiness: u16,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds to wait for the initial cache sync; waits until stopped when unset
    #[arg(long)]
    pub cache_sync_timeout: Option<u64>,

    /// Failed attempts after which an event is dropped
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,
}

impl Config {
    /// Builds the filter from the three allow-list flags.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedAllowList`] for an unusable entry.
    pub fn filter_config(&self) -> Result<FilterConfig, ConfigError> {
        FilterConfig::parse(&self.types, &self.involved_objects, &self.reasons)
    }

    /// Cache sync timeout as a [`Duration`].
    pub fn cache_sync_timeout(&self) -> Option<Duration> {
        self.cache_sync_timeout.map(Duration::from_secs)
    }

    /// Builds a Kubernetes client.
    ///
    /// Uses the kubeconfig file when one is given, in-cluster configuration
    /// otherwise. `--master` replaces the cluster URL either way.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if no usable configuration is found.
    pub async fn kube_client(&self) -> Result<Client, ConfigError> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                info!("Loading kubeconfig from {}", path.display());
                let kubeconfig =
                    Kubeconfig::read_from(path).map_err(|e| ConfigError::Kubeconfig(e.to_string()))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ConfigError::Kubeconfig(e.to_string()))?
            }
            None => kube::Config::incluster().map_err(|e| ConfigError::InCluster(e.to_string()))?,
        };

        if let Some(master) = &self.master {
            config.cluster_url = master.parse::<http::Uri>().map_err(|source| ConfigError::InvalidMaster {
                url: master.clone(),
                source,
            })?;
        }
        info!("Using API server {}", config.cluster_url);

        Ok(Client::try_from(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        Config::try_parse_from(std::iter::once("event-exporter").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.threadiness, 1);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.cache_sync_timeout(), None);
        assert!(config.master.is_none());

        let filter = config.filter_config().unwrap();
        assert_eq!(filter, FilterConfig::default());
        assert!(filter.accepts("Normal", "Pod", "Pulled"));
    }

    #[test]
    fn test_allow_list_flags() {
        let config = parse(&[
            "--types",
            "Warning",
            "--involved-objects",
            "Pod,Node",
            "--reasons",
            "FailedMount",
        ])
        .unwrap();
        let filter = config.filter_config().unwrap();
        assert!(filter.accepts("Warning", "Node", "FailedMount"));
        assert!(!filter.accepts("Normal", "Node", "FailedMount"));
        assert!(!filter.accepts("Warning", "Service", "FailedMount"));
    }

    #[test]
    fn test_involved_objects_camel_case_alias() {
        let config = parse(&["--involvedObjects", "Pod"]).unwrap();
        assert_eq!(config.involved_objects, "Pod");
    }

    #[test]
    fn test_malformed_allow_list_is_rejected() {
        let config = parse(&["--types", "Warning, Normal"]).unwrap();
        let err = config.filter_config().unwrap_err();
        assert!(matches!(err, ConfigError::MalformedAllowList { flag: "types", .. }));
    }

    #[test]
    fn test_threadiness_must_be_positive() {
        assert!(parse(&["--threadiness", "0"]).is_err());
        assert_eq!(parse(&["--threadiness", "4"]).unwrap().threadiness, 4);
    }

    #[test]
    fn test_cache_sync_timeout() {
        let config = parse(&["--cache-sync-timeout", "30", "--max-retries", "2"]).unwrap();
        assert_eq!(config.cache_sync_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_retries, 2);
    }

    #[tokio::test]
    async fn test_invalid_master_url() {
        let dir = std::env::temp_dir().join(format!("event-exporter-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("kubeconfig");
        std::fs::write(
            &path,
            r#"
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: test
  context:
    cluster: test
    user: test
current-context: test
users:
- name: test
  user:
    token: abc
"#,
        )
        .unwrap();

        let config = parse(&["--kubeconfig", path.to_str().unwrap(), "--master", "not a url"]).unwrap();
        let err = config.kube_client().await.err().unwrap();
        assert!(matches!(err, ConfigError::InvalidMaster { .. }));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_file() {
        let config = parse(&["--kubeconfig", "/nonexistent/event-exporter/kubeconfig"]).unwrap();
        let err = config.kube_client().await.err().unwrap();
        assert!(matches!(err, ConfigError::Kubeconfig(_)));
    }
}
