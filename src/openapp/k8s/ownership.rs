/*
 * Copyright (C) 2024 The OpenAPP Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Label and finalizer helpers shared by the controllers and the in-memory
//! cluster.

use kube::Resource;
use std::collections::BTreeMap;

/// Equality selector matching objects labelled `key=value`.
pub fn selector_for(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

/// Evaluates a comma separated equality selector (`a=b,c=d`) against a label
/// map. Empty selectors match everything.
pub fn selector_matches(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                let value = value.trim().trim_start_matches('=');
                labels
                    .and_then(|labels| labels.get(key))
                    .is_some_and(|current| current == value)
            }
            None => labels.is_some_and(|labels| labels.contains_key(term)),
        })
}

/// Adds `extra` on top of the object's labels; `extra` wins on collisions.
pub fn merge_labels<K: Resource>(object: &mut K, extra: &BTreeMap<String, String>) {
    let labels = object.meta_mut().labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in extra {
        labels.insert(key.clone(), value.clone());
    }
}

pub fn label_value<'a, K: Resource>(object: &'a K, key: &str) -> Option<&'a str> {
    object
        .meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn has_finalizer<K: Resource>(object: &K, finalizer: &str) -> bool {
    object
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|list| list.iter().any(|entry| entry == finalizer))
}

/// Returns `true` when the finalizer was newly added.
pub fn add_finalizer<K: Resource>(object: &mut K, finalizer: &str) -> bool {
    if has_finalizer(object, finalizer) {
        return false;
    }
    object
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Removes only `finalizer`, leaving entries owned by other controllers.
/// Returns `true` when something was removed.
pub fn remove_finalizer<K: Resource>(object: &mut K, finalizer: &str) -> bool {
    let Some(list) = object.meta_mut().finalizers.as_mut() else {
        return false;
    };
    let before = list.len();
    list.retain(|entry| entry != finalizer);
    before != list.len()
}

pub fn is_terminating<K: Resource>(object: &K) -> bool {
    object.meta().deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn selector_requires_every_term() {
        let set = labels(&[("app", "demo"), ("tier", "web")]);
        assert!(selector_matches(Some(&set), "app=demo"));
        assert!(selector_matches(Some(&set), "app=demo,tier=web"));
        assert!(!selector_matches(Some(&set), "app=demo,tier=db"));
        assert!(!selector_matches(None, "app=demo"));
        assert!(selector_matches(None, ""));
    }

    #[test]
    fn finalizer_helpers_touch_only_named_entry() {
        let mut cm = ConfigMap {
            metadata: ObjectMeta {
                finalizers: Some(vec!["other".to_string()]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(add_finalizer(&mut cm, "ours"));
        assert!(!add_finalizer(&mut cm, "ours"));
        assert!(has_finalizer(&cm, "ours"));
        assert!(remove_finalizer(&mut cm, "ours"));
        assert_eq!(cm.metadata.finalizers, Some(vec!["other".to_string()]));
        assert!(!remove_finalizer(&mut cm, "ours"));
    }

    #[test]
    fn merge_labels_overrides_existing_keys() {
        let mut cm = ConfigMap {
            metadata: ObjectMeta {
                labels: Some(labels(&[("owner", "manifest"), ("keep", "yes")])),
                ..Default::default()
            },
            ..Default::default()
        };
        merge_labels(&mut cm, &labels(&[("owner", "controller")]));
        assert_eq!(label_value(&cm, "owner"), Some("controller"));
        assert_eq!(label_value(&cm, "keep"), Some("yes"));
    }
}
