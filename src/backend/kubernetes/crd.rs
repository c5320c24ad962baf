// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Resource types stored in Kubernetes, and their patch recipes.
//!
//! Three custom resources live in the configured namespace:
//!
//! - [`Zone`] holds the serial and the published ACME challenge answers.
//! - [`UpdateKey`] points at an opaque Secret holding the HMAC material.
//! - [`UpdateKeyZoneBinding`] authorizes one key for one zone. Bindings are
//!   owner-referenced by both sides so deleting either cascades.
//!
//! Every kind implements [`WatchedObject`]: it can name itself, produce a
//! mutated copy together with a guarded JSON-patch document, and decide
//! whether a newer cached version already reflects a submitted change.

use crate::backend::kubernetes::cache::{PatchOp, WatchedObject};
use k8s_openapi::api::core::v1::Secret;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Spec of the `Zone` resource.
///
/// `acme_challenge_answers` is always serialized, even when empty, so that
/// the patch recipe can `replace` it unconditionally.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "acmedns.io", version = "v1", kind = "Zone", namespaced)]
pub struct ZoneSpec {
    /// Monotonically increasing zone serial.
    #[serde(default)]
    pub serial: u32,
    /// Published ACME challenge answers, in order.
    #[serde(default)]
    pub acme_challenge_answers: Vec<String>,
    /// Enables verbose per-request diagnostics for this zone.
    #[serde(default)]
    pub debug: bool,
}

/// Spec of the `UpdateKey` resource.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "acmedns.io", version = "v1", kind = "UpdateKey", namespaced)]
pub struct UpdateKeySpec {
    /// Reference to the Secret entry holding the base64 HMAC material.
    #[serde(rename = "secretRef")]
    pub secret_ref: SecretRef,
}

/// Reference to one entry of an opaque Secret.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SecretRef {
    /// Name of the Secret object.
    pub name: String,
    /// Key within the Secret's data map.
    pub key: String,
}

/// Spec of the `UpdateKeyZoneBinding` resource.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "acmedns.io",
    version = "v1",
    kind = "UpdateKeyZoneBinding",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKeyZoneBindingSpec {
    /// The zone side of the binding.
    pub zone: String,
    /// The update key side of the binding.
    pub update_key: String,
}

impl WatchedObject for Zone {
    const KIND: &'static str = "Zone";

    fn mutated(&self, mutate: &mut (dyn FnMut(&mut Self) + Send)) -> (Self, Vec<PatchOp>) {
        let mut next = self.clone();
        mutate(&mut next);
        let ops = vec![
            PatchOp::test("/spec/serial", json!(self.spec.serial)),
            PatchOp::replace("/spec/serial", json!(next.spec.serial)),
            PatchOp::replace(
                "/spec/acme_challenge_answers",
                json!(next.spec.acme_challenge_answers),
            ),
        ];
        (next, ops)
    }

    fn materializes(&self, observed: &Self) -> bool {
        observed.spec.serial >= self.spec.serial
    }
}

impl WatchedObject for UpdateKey {
    const KIND: &'static str = "UpdateKey";

    fn mutated(&self, mutate: &mut (dyn FnMut(&mut Self) + Send)) -> (Self, Vec<PatchOp>) {
        let mut next = self.clone();
        mutate(&mut next);
        let ops = vec![
            PatchOp::test("/spec/secretRef/name", json!(self.spec.secret_ref.name)),
            PatchOp::test("/spec/secretRef/key", json!(self.spec.secret_ref.key)),
            PatchOp::replace("/spec/secretRef/name", json!(next.spec.secret_ref.name)),
            PatchOp::replace("/spec/secretRef/key", json!(next.spec.secret_ref.key)),
        ];
        (next, ops)
    }

    fn materializes(&self, observed: &Self) -> bool {
        observed.spec.secret_ref == self.spec.secret_ref
    }
}

impl WatchedObject for UpdateKeyZoneBinding {
    const KIND: &'static str = "UpdateKeyZoneBinding";

    fn mutated(&self, mutate: &mut (dyn FnMut(&mut Self) + Send)) -> (Self, Vec<PatchOp>) {
        let mut next = self.clone();
        mutate(&mut next);
        let ops = vec![
            PatchOp::test("/spec/zone", json!(self.spec.zone)),
            PatchOp::test("/spec/updateKey", json!(self.spec.update_key)),
            PatchOp::replace("/spec/zone", json!(next.spec.zone)),
            PatchOp::replace("/spec/updateKey", json!(next.spec.update_key)),
        ];
        (next, ops)
    }

    fn materializes(&self, observed: &Self) -> bool {
        observed.spec == self.spec
    }
}

impl WatchedObject for Secret {
    const KIND: &'static str = "Secret";

    fn mutated(&self, mutate: &mut (dyn FnMut(&mut Self) + Send)) -> (Self, Vec<PatchOp>) {
        let mut next = self.clone();
        mutate(&mut next);
        let mut ops = vec![
            PatchOp::test("/data", json!(self.data)),
            PatchOp::replace("/data", json!(next.data)),
        ];
        // Owner references are only touched by the post-create backfill;
        // "add" both inserts and replaces, so it works on fresh objects.
        if next.metadata.owner_references != self.metadata.owner_references {
            ops.push(PatchOp::add(
                "/metadata/ownerReferences",
                json!(next.metadata.owner_references),
            ));
        }
        (next, ops)
    }

    fn materializes(&self, observed: &Self) -> bool {
        observed.data == self.data
    }
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
