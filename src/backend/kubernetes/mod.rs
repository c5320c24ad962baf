// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Kubernetes-backed implementation of the backend contract.
//!
//! Zones, update keys and key bindings are custom resources; HMAC material
//! lives in opaque Secrets referenced by the keys. Four watched caches (one
//! per kind) serve all reads from memory, so the DNS hot path never waits on
//! the API server. A secondary index maps key names to the bindings that
//! reference them; it is maintained by the binding cache's change handler
//! and backs the `zones` projection of [`Backend::get_key`].

pub(crate) mod cache;
pub mod config;
pub mod crd;
pub(crate) mod waiter;

use crate::backend::kubernetes::cache::{Change, ChangeHandler, ObjectCache, WatchedObject};
use crate::backend::kubernetes::crd::{
    SecretRef, UpdateKey, UpdateKeySpec, UpdateKeyZoneBinding, UpdateKeyZoneBindingSpec, Zone,
    ZoneSpec,
};
use crate::backend::{Backend, KeyRecord, ZoneRecord};
use crate::config::KubernetesConfig;
use crate::constants::{API_GROUP, API_VERSION, SECRET_DATA_KEY};
use crate::errors::BackendError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BindingIndex = Arc<RwLock<HashMap<String, HashMap<String, UpdateKeyZoneBindingSpec>>>>;

/// Backend storing its state as Kubernetes resources.
pub struct KubernetesBackend {
    namespace: String,
    zones: ObjectCache<Zone>,
    keys: ObjectCache<UpdateKey>,
    bindings: ObjectCache<UpdateKeyZoneBinding>,
    secrets: ObjectCache<Secret>,
    bindings_by_key: BindingIndex,
}

impl KubernetesBackend {
    /// Connect to the cluster and prime all four caches. Fails fast when
    /// any initial list fails, so server startup doubles as a readiness
    /// check.
    pub async fn new(config: &KubernetesConfig) -> Result<Self, BackendError> {
        let client = config::build_client(config).await?;
        let namespace = config.namespace.clone();

        let bindings_by_key: BindingIndex = Arc::new(RwLock::new(HashMap::new()));
        let handler: ChangeHandler<UpdateKeyZoneBinding> = {
            let index = bindings_by_key.clone();
            Arc::new(move |change, new, old| update_binding_index(&index, change, new, old))
        };

        let zones = ObjectCache::new(client.clone(), &namespace, None).await?;
        let keys = match ObjectCache::new(client.clone(), &namespace, None).await {
            Ok(cache) => cache,
            Err(err) => {
                zones.close().await;
                return Err(err);
            }
        };
        let bindings = match ObjectCache::new(client.clone(), &namespace, Some(handler)).await {
            Ok(cache) => cache,
            Err(err) => {
                keys.close().await;
                zones.close().await;
                return Err(err);
            }
        };
        let secrets = match ObjectCache::new(client, &namespace, None).await {
            Ok(cache) => cache,
            Err(err) => {
                bindings.close().await;
                keys.close().await;
                zones.close().await;
                return Err(err);
            }
        };

        info!(namespace = %namespace, "kubernetes backend ready");
        Ok(Self {
            namespace,
            zones,
            keys,
            bindings,
            secrets,
            bindings_by_key,
        })
    }

    fn bound_zones(&self, key: &str) -> Vec<String> {
        let index = self
            .bindings_by_key
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(bindings) = index.get(key) else {
            return Vec::new();
        };
        let zones: BTreeSet<&str> = bindings.values().map(|spec| spec.zone.as_str()).collect();
        zones.into_iter().map(str::to_owned).collect()
    }

    fn owner_reference(kind: &str, name: &str, uid: Option<&String>) -> OwnerReference {
        OwnerReference {
            api_version: format!("{API_GROUP}/{API_VERSION}"),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.cloned().unwrap_or_default(),
            ..OwnerReference::default()
        }
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    async fn get_zone(
        &self,
        _cancel: &CancellationToken,
        zone: &str,
    ) -> Result<ZoneRecord, BackendError> {
        let object = self.zones.get(zone).map_err(|err| {
            if err.is_not_found() {
                BackendError::ZoneNotFound { zone: zone.into() }
            } else {
                err
            }
        })?;
        Ok(ZoneRecord {
            serial: object.spec.serial,
            acme_answers: object.spec.acme_challenge_answers,
            debug: object.spec.debug,
        })
    }

    async fn set_zone(
        &self,
        cancel: &CancellationToken,
        zone: &str,
        acme_answers: Vec<String>,
    ) -> Result<(), BackendError> {
        self.zones
            .set(cancel, zone, &mut |object: &mut Zone| {
                object.spec.acme_challenge_answers = acme_answers.clone();
                object.spec.serial = object.spec.serial.wrapping_add(1);
            })
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    BackendError::ZoneNotFound { zone: zone.into() }
                } else {
                    err
                }
            })
    }

    async fn get_key(
        &self,
        _cancel: &CancellationToken,
        key: &str,
    ) -> Result<KeyRecord, BackendError> {
        let object = self.keys.get(key).map_err(|err| {
            if err.is_not_found() {
                BackendError::KeyNotFound { key: key.into() }
            } else {
                err
            }
        })?;

        let secret_ref = &object.spec.secret_ref;
        let secret = self.secrets.get(&secret_ref.name).map_err(|err| {
            if err.is_not_found() {
                debug!(
                    key = %key,
                    secret = %secret_ref.name,
                    "referenced secret not found"
                );
                BackendError::KeyNotFound { key: key.into() }
            } else {
                err
            }
        })?;

        let material = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&secret_ref.key))
            .ok_or_else(|| {
                debug!(
                    key = %key,
                    secret = %secret_ref.name,
                    entry = %secret_ref.key,
                    "referenced secret does not contain the expected data entry"
                );
                BackendError::KeyNotFound { key: key.into() }
            })?;
        let secret_value =
            String::from_utf8(material.0.clone()).map_err(|_| BackendError::KeyNotFound {
                key: key.into(),
            })?;

        Ok(KeyRecord {
            secret: secret_value,
            zones: self.bound_zones(key),
        })
    }

    async fn create_zone(
        &self,
        cancel: &CancellationToken,
        zone: &str,
    ) -> Result<(), BackendError> {
        info!(zone = %zone, "creating zone");
        self.zones
            .create(cancel, &Zone::new(zone, ZoneSpec::default()))
            .await?;
        Ok(())
    }

    async fn delete_zone(
        &self,
        cancel: &CancellationToken,
        zone: &str,
    ) -> Result<(), BackendError> {
        info!(zone = %zone, "deleting zone");
        // Bindings referencing the zone cascade through their owner
        // references.
        self.zones.delete(cancel, zone).await
    }

    async fn create_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
        secret: &str,
    ) -> Result<(), BackendError> {
        info!(key = %key, "creating update key");
        let new_secret = Secret {
            metadata: ObjectMeta {
                generate_name: Some(format!("{key}-")),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                SECRET_DATA_KEY.to_string(),
                ByteString(secret.as_bytes().to_vec()),
            )])),
            ..Secret::default()
        };
        let stored_secret = self.secrets.create(cancel, &new_secret).await.map_err(|err| {
            warn!(key = %key, error = %err, "failed to create secret for update key");
            err
        })?;
        let secret_name = stored_secret
            .metadata
            .name
            .clone()
            .unwrap_or_default();

        let new_key = UpdateKey::new(
            key,
            UpdateKeySpec {
                secret_ref: SecretRef {
                    name: secret_name.clone(),
                    key: SECRET_DATA_KEY.to_string(),
                },
            },
        );
        let stored_key = match self.keys.create(cancel, &new_key).await {
            Ok(stored) => stored,
            Err(err) => {
                // Clean up the orphan secret; it has no owner yet.
                if let Err(cleanup) = self.secrets.delete(cancel, &secret_name).await {
                    warn!(
                        key = %key,
                        secret = %secret_name,
                        error = %cleanup,
                        "cannot clean up secret after update key creation failed"
                    );
                }
                if !err.is_conflict() {
                    warn!(key = %key, error = %err, "failed to create update key");
                }
                return Err(err);
            }
        };

        // Best effort: point the secret at its key so cascade deletion
        // cleans it up. The key works without it.
        let owner =
            Self::owner_reference("UpdateKey", key, stored_key.metadata.uid.as_ref());
        if let Err(err) = self
            .secrets
            .set(cancel, &secret_name, &mut |object: &mut Secret| {
                object.metadata.owner_references = Some(vec![owner.clone()]);
            })
            .await
        {
            warn!(
                key = %key,
                secret = %secret_name,
                error = %err,
                "could not set owner reference on secret, it will not be cleaned up with its key"
            );
        }
        Ok(())
    }

    async fn delete_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<(), BackendError> {
        info!(key = %key, "deleting update key");
        // The secret and the bindings cascade through owner references.
        self.keys.delete(cancel, key).await
    }

    async fn set_key_secret(
        &self,
        cancel: &CancellationToken,
        key: &str,
        secret: &str,
    ) -> Result<(), BackendError> {
        info!(key = %key, "rotating update key secret");
        let object = self.keys.get(key).map_err(|err| {
            if err.is_not_found() {
                BackendError::KeyNotFound { key: key.into() }
            } else {
                err
            }
        })?;
        let secret_ref = object.spec.secret_ref;
        let material = ByteString(secret.as_bytes().to_vec());
        self.secrets
            .set(cancel, &secret_ref.name, &mut |object: &mut Secret| {
                object
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(secret_ref.key.clone(), material.clone());
            })
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    BackendError::KeyNotFound { key: key.into() }
                } else {
                    err
                }
            })
    }

    async fn bind_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
        zone: &str,
    ) -> Result<(), BackendError> {
        info!(key = %key, zone = %zone, "binding update key to zone");
        let key_object = self.keys.get(key).map_err(|err| {
            if err.is_not_found() {
                BackendError::KeyNotFound { key: key.into() }
            } else {
                err
            }
        })?;
        let zone_object = self.zones.get(zone).map_err(|err| {
            if err.is_not_found() {
                BackendError::ZoneNotFound { zone: zone.into() }
            } else {
                err
            }
        })?;

        let binding = UpdateKeyZoneBinding {
            metadata: ObjectMeta {
                generate_name: Some(format!("{key}-binding-{zone}-")),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![
                    Self::owner_reference("UpdateKey", key, key_object.metadata.uid.as_ref()),
                    Self::owner_reference("Zone", zone, zone_object.metadata.uid.as_ref()),
                ]),
                ..ObjectMeta::default()
            },
            spec: UpdateKeyZoneBindingSpec {
                zone: zone.to_string(),
                update_key: key.to_string(),
            },
        };
        self.bindings.create(cancel, &binding).await?;
        Ok(())
    }

    async fn unbind_key(
        &self,
        cancel: &CancellationToken,
        key: &str,
        zone: &str,
    ) -> Result<(), BackendError> {
        // Snapshot the matching binding names first: deleting blocks on
        // watch events whose handler takes the index write lock.
        let matching: Vec<String> = {
            let index = self
                .bindings_by_key
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            index
                .get(key)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(_, spec)| spec.zone == zone)
                        .map(|(name, _)| name.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for name in matching {
            match self.bindings.delete(cancel, &name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(
                        binding = %name,
                        key = %key,
                        zone = %zone,
                        error = %err,
                        "error unbinding update key from zone"
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<(), BackendError> {
        self.secrets.close().await;
        self.bindings.close().await;
        self.keys.close().await;
        self.zones.close().await;
        Ok(())
    }
}

/// Keep the bindings-by-key index in step with the binding cache. Runs
/// under the cache's map lock.
fn update_binding_index(
    index: &RwLock<HashMap<String, HashMap<String, UpdateKeyZoneBindingSpec>>>,
    change: Change,
    new: Option<&UpdateKeyZoneBinding>,
    old: Option<&UpdateKeyZoneBinding>,
) {
    let mut index = index.write().unwrap_or_else(PoisonError::into_inner);

    if matches!(change, Change::Updated | Change::Deleted) {
        if let Some(old) = old {
            let key = &old.spec.update_key;
            let now_empty = match index.get_mut(key) {
                Some(bindings) => {
                    bindings.remove(&old.object_name());
                    bindings.is_empty()
                }
                None => false,
            };
            if now_empty {
                index.remove(key);
            }
        }
    }
    if let Some(new) = new {
        index
            .entry(new.spec.update_key.clone())
            .or_default()
            .insert(new.object_name(), new.spec.clone());
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod provider_tests;
