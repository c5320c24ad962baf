// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Unit tests for the binding index maintenance.

#[cfg(test)]
mod tests {
    use crate::backend::kubernetes::cache::Change;
    use crate::backend::kubernetes::crd::{UpdateKeyZoneBinding, UpdateKeyZoneBindingSpec};
    use crate::backend::kubernetes::update_binding_index;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashMap;
    use std::sync::RwLock;

    fn binding(name: &str, key: &str, zone: &str) -> UpdateKeyZoneBinding {
        UpdateKeyZoneBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: UpdateKeyZoneBindingSpec {
                zone: zone.to_string(),
                update_key: key.to_string(),
            },
        }
    }

    type Index = RwLock<HashMap<String, HashMap<String, UpdateKeyZoneBindingSpec>>>;

    fn zones_of(index: &Index, key: &str) -> Vec<String> {
        let index = index.read().expect("index lock");
        let mut zones: Vec<String> = index
            .get(key)
            .map(|bindings| bindings.values().map(|spec| spec.zone.clone()).collect())
            .unwrap_or_default();
        zones.sort();
        zones
    }

    #[test]
    fn test_add_populates_index() {
        let index = Index::default();
        let b = binding("test-binding-1", "test", "example.com");
        update_binding_index(&index, Change::Added, Some(&b), None);
        assert_eq!(zones_of(&index, "test"), vec!["example.com"]);
    }

    #[test]
    fn test_delete_removes_entry_and_empty_bucket() {
        let index = Index::default();
        let b = binding("test-binding-1", "test", "example.com");
        update_binding_index(&index, Change::Added, Some(&b), None);
        update_binding_index(&index, Change::Deleted, None, Some(&b));
        assert!(zones_of(&index, "test").is_empty());
        assert!(index.read().expect("index lock").is_empty());
    }

    #[test]
    fn test_update_moves_binding_between_keys() {
        let index = Index::default();
        let old = binding("binding-1", "alpha", "example.com");
        update_binding_index(&index, Change::Added, Some(&old), None);

        let new = binding("binding-1", "beta", "example.com");
        update_binding_index(&index, Change::Updated, Some(&new), Some(&old));

        assert!(zones_of(&index, "alpha").is_empty());
        assert_eq!(zones_of(&index, "beta"), vec!["example.com"]);
    }

    #[test]
    fn test_multiple_bindings_per_key_survive_single_delete() {
        let index = Index::default();
        let first = binding("binding-1", "test", "a.example");
        let second = binding("binding-2", "test", "b.example");
        update_binding_index(&index, Change::Added, Some(&first), None);
        update_binding_index(&index, Change::Added, Some(&second), None);
        update_binding_index(&index, Change::Deleted, None, Some(&first));
        assert_eq!(zones_of(&index, "test"), vec!["b.example"]);
    }
}
