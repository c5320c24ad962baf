// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Kubernetes client construction.
//!
//! With an explicit `api_url` the connection is described through a
//! programmatically built kubeconfig, which lets the kube crate handle the
//! PEM loading for file-based credentials. Without one, the client is
//! inferred from the standard environment (kubeconfig file or in-cluster
//! service account), like any other controller.

use crate::config::KubernetesConfig;
use crate::errors::BackendError;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

pub(crate) async fn build_client(config: &KubernetesConfig) -> Result<Client, BackendError> {
    let mut client_config = match &config.api_url {
        Some(api_url) => {
            debug!(api_url = %api_url, "building kubernetes client from explicit configuration");
            let kubeconfig = explicit_kubeconfig(config, api_url)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|err| BackendError::RequestFailed {
                    reason: "cannot build kubernetes client configuration".to_string(),
                    source: Some(Box::new(err)),
                })?
        }
        None => {
            debug!("inferring kubernetes client from the environment");
            kube::Config::infer()
                .await
                .map_err(|err| BackendError::RequestFailed {
                    reason: "cannot infer kubernetes client configuration".to_string(),
                    source: Some(Box::new(err)),
                })?
        }
    };

    client_config.default_namespace = config.namespace.clone();
    if let Some(secs) = config.timeout_secs {
        let timeout = Duration::from_secs(secs);
        client_config.connect_timeout = Some(timeout);
        client_config.read_timeout = Some(timeout);
        client_config.write_timeout = Some(timeout);
    }

    Client::try_from(client_config).map_err(|err| BackendError::RequestFailed {
        reason: "cannot construct kubernetes client".to_string(),
        source: Some(Box::new(err)),
    })
}

fn explicit_kubeconfig(
    config: &KubernetesConfig,
    api_url: &str,
) -> Result<Kubeconfig, BackendError> {
    let mut cluster = Map::new();
    cluster.insert("server".to_string(), json!(api_url));
    if let Some(ca_cert) = &config.ca_cert {
        cluster.insert("certificate-authority".to_string(), json!(ca_cert));
    }
    if config.insecure_skip_tls_verify {
        cluster.insert("insecure-skip-tls-verify".to_string(), json!(true));
    }

    let mut user = Map::new();
    if let Some(token) = &config.token {
        user.insert("token".to_string(), json!(token));
    }
    if let Some(token_file) = &config.token_file {
        user.insert("tokenFile".to_string(), json!(token_file));
    }
    if let Some(username) = &config.username {
        user.insert("username".to_string(), json!(username));
    }
    if let Some(password) = &config.password {
        user.insert("password".to_string(), json!(password));
    }
    if let Some(client_cert) = &config.client_cert {
        user.insert("client-certificate".to_string(), json!(client_cert));
    }
    if let Some(client_key) = &config.client_key {
        user.insert("client-key".to_string(), json!(client_key));
    }

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": "acmedns",
        "clusters": [{"name": "acmedns", "cluster": Value::Object(cluster)}],
        "users": [{"name": "acmedns", "user": Value::Object(user)}],
        "contexts": [{
            "name": "acmedns",
            "context": {
                "cluster": "acmedns",
                "user": "acmedns",
                "namespace": config.namespace,
            },
        }],
    });

    serde_json::from_value(document).map_err(|err| BackendError::RequestFailed {
        reason: "cannot assemble kubeconfig from backend options".to_string(),
        source: Some(Box::new(err)),
    })
}
