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

//! Prints the CustomResourceDefinitions as a multi-document YAML stream.

use openapp::openapp::api::custom_resource_definitions;

fn main() {
    let mut documents = Vec::new();
    for crd in custom_resource_definitions() {
        match serde_yaml::to_string(&crd) {
            Ok(document) => documents.push(document),
            Err(err) => {
                eprintln!("failed to serialize CustomResourceDefinition: {err}");
                std::process::exit(1);
            }
        }
    }
    print!("{}", documents.join("---\n"));
}
