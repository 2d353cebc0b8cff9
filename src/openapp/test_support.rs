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

#![allow(dead_code)]

//! Fixtures shared by unit and integration tests: on-disk registry
//! checkouts, canned manifests, sample instances and polling helpers.

use crate::openapp::api::{
    AppInstance, AppInstanceSpec, PublicServiceInstance, PublicServiceInstanceSpec,
};
use crate::openapp::config::ControllerSettings;
use crate::openapp::template::TemplateRegistry;
use std::env;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

pub const TEST_NAMESPACE: &str = "openapp";
pub const TEST_NODE_ADDRESS: &str = "192.168.1.10";

pub const CONFIGMAP_MANIFEST: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ .openapp.instance_name }}-config
data:
  port: "{{ .inputs.port }}"
"#;

pub const SERVICE_MANIFEST: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: {{ .openapp.instance_name }}
spec:
  type: NodePort
  selector:
    app: {{ .openapp.instance_name }}
  ports:
    - name: http
      port: {{ .inputs.port }}
"#;

pub const STATEFULSET_MANIFEST: &str = r#"apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: {{ .openapp.instance_name }}
spec:
  serviceName: {{ .openapp.instance_name }}
  selector:
    matchLabels:
      app: {{ .openapp.instance_name }}
  template:
    metadata:
      labels:
        app: {{ .openapp.instance_name }}
    spec:
      containers:
        - name: main
          image: nginx
"#;

fn target_dir() -> PathBuf {
    if let Ok(dir) = env::var("CARGO_TARGET_DIR") {
        PathBuf::from(dir)
    } else if let Ok(dir) = env::var("OPENAPP_TEST_TARGET_DIR") {
        PathBuf::from(dir)
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("target")
    }
}

/// Returns a unique directory under `target/test-output/<component>/`.
/// The directory is created eagerly and returned to the caller.
pub fn test_output_dir(component: &str) -> PathBuf {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| AtomicU64::new(0));
    let mut path = target_dir();
    path.push("test-output");
    path.push(component);
    path.push(format!(
        "pid{}-{}",
        std::process::id(),
        counter.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("create test output directory");
    path
}

/// Registry cache laid out on disk. Writes go to one registry checkout,
/// `default` unless selected with [`RegistryFixture::in_registry`].
pub struct RegistryFixture {
    root: PathBuf,
    checkout: String,
}

impl Default for RegistryFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFixture {
    pub fn new() -> Self {
        Self {
            root: test_output_dir("registry"),
            checkout: "default".to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> TemplateRegistry {
        TemplateRegistry::new(&self.root)
    }

    /// Settings pointing at this registry cache with a fixed node address
    /// and short queue backoff.
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            registry_root: self.root.clone(),
            node_address: Some(TEST_NODE_ADDRESS.to_string()),
            queue_base_delay: Duration::from_millis(5),
            queue_max_delay: Duration::from_millis(200),
            ..ControllerSettings::default()
        }
    }

    pub fn in_registry(&self, checkout: &str) -> RegistryFixture {
        RegistryFixture {
            root: self.root.clone(),
            checkout: checkout.to_string(),
        }
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root.join(&self.checkout).join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture directory");
        }
        fs::write(&path, content).expect("write fixture file");
        path
    }

    pub fn app_template(&self, name: &str, expose_type: &str) -> TemplateFixture {
        let document = format!(
            "apiVersion: app.openapp.dev/v1alpha1\nkind: AppTemplate\nmetadata:\n  name: {name}\nspec:\n  title: {name}\n  author: openapp\n  inputs: |\n    port: 80\n  exposeType: {expose_type}\n"
        );
        self.template("app-template", name, &document)
    }

    pub fn public_service_template(&self, name: &str, expose_types: &[&str]) -> TemplateFixture {
        let list = expose_types
            .iter()
            .map(|expose| format!("\n    - {}", expose))
            .collect::<String>();
        let document = format!(
            "apiVersion: service.openapp.dev/v1alpha1\nkind: PublicServiceTemplate\nmetadata:\n  name: {name}\nspec:\n  title: {name}\n  author: openapp\n  exposeTypes:{}\n",
            if list.is_empty() { " []".to_string() } else { list }
        );
        self.template("publicservice-template", name, &document)
    }

    /// Application template `name` with a ConfigMap, a NodePort Service and
    /// a StatefulSet, all named after the instance.
    pub fn web_app_template(&self, name: &str, expose_type: &str) -> TemplateFixture {
        self.app_template(name, expose_type)
            .manifest("statefulset.yaml", STATEFULSET_MANIFEST)
            .manifest("service.yaml", SERVICE_MANIFEST)
            .manifest("configmap.yaml", CONFIGMAP_MANIFEST)
    }

    fn template(&self, family: &str, name: &str, document: &str) -> TemplateFixture {
        let path = self.write_file(&format!("{}/{}/template.yaml", family, name), document);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(dir.join("manifests")).expect("create manifests directory");
        TemplateFixture { dir }
    }
}

pub struct TemplateFixture {
    dir: PathBuf,
}

impl TemplateFixture {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(self, file_name: &str, content: &str) -> Self {
        fs::write(self.dir.join("manifests").join(file_name), content)
            .expect("write manifest fixture");
        self
    }

    pub fn remove_manifest(self, file_name: &str) -> Self {
        let _ = fs::remove_file(self.dir.join("manifests").join(file_name));
        self
    }
}

pub fn app_instance(name: &str, template: &str, inputs: &str) -> AppInstance {
    let mut instance = AppInstance::new(
        name,
        AppInstanceSpec {
            app_template: template.to_string(),
            inputs: inputs.to_string(),
            ..Default::default()
        },
    );
    instance.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    instance
}

pub fn public_service_instance(name: &str, template: &str, inputs: &str) -> PublicServiceInstance {
    let mut instance = PublicServiceInstance::new(
        name,
        PublicServiceInstanceSpec {
            public_service_template: template.to_string(),
            inputs: inputs.to_string(),
        },
    );
    instance.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    instance
}

/// Polls `check` every 10ms until it returns `true` or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
